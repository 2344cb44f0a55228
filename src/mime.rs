//! Minimal MIME handling for the DATA payload.
//!
//! Splits an accumulated message into subject, text body, and attachments.
//! Attachments are multipart parts carrying `Content-Disposition: attachment`
//! with a base64 body. Anything this module does not recognise stays in the
//! body untouched.

use crate::error::{MailError, Result};
use crate::message::Attachment;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};

#[derive(Debug, Default, PartialEq)]
pub struct ParsedMail {
    pub subject: String,
    pub body: String,
    pub attachments: Vec<Attachment>,
}

/// Parses the raw DATA payload (CRLF line endings, headers first).
pub fn parse(data: &str) -> Result<ParsedMail> {
    let (headers, rest) = split_headers(data);

    let subject = header_value(&headers, "Subject").unwrap_or_default();
    let content_type = header_value(&headers, "Content-Type").unwrap_or_default();

    let mut parsed = ParsedMail {
        subject,
        ..Default::default()
    };

    match boundary_param(&content_type) {
        Some(boundary) => parse_multipart(rest, &boundary, &mut parsed)?,
        None => parsed.body = rest.to_string(),
    }

    Ok(parsed)
}

/// Splits raw text into (header lines, body after the first empty line).
fn split_headers(data: &str) -> (Vec<&str>, &str) {
    if let Some(pos) = data.find("\r\n\r\n") {
        let headers = data[..pos].split("\r\n").collect();
        (headers, &data[pos + 4..])
    } else {
        // No blank line: treat the whole payload as body
        (Vec::new(), data)
    }
}

fn header_value(headers: &[&str], name: &str) -> Option<String> {
    let prefix = format!("{}:", name).to_ascii_lowercase();
    headers
        .iter()
        .find(|line| line.to_ascii_lowercase().starts_with(&prefix))
        .map(|line| line[prefix.len()..].trim().to_string())
}

/// Extracts the boundary parameter from a multipart Content-Type value.
fn boundary_param(content_type: &str) -> Option<String> {
    if !content_type
        .to_ascii_lowercase()
        .starts_with("multipart/")
    {
        return None;
    }
    content_type.split(';').find_map(|param| {
        let param = param.trim();
        let rest = param
            .strip_prefix("boundary=")
            .or_else(|| param.strip_prefix("BOUNDARY="))?;
        Some(rest.trim_matches('"').to_string())
    })
}

fn parse_multipart(body: &str, boundary: &str, parsed: &mut ParsedMail) -> Result<()> {
    let delimiter = format!("--{}", boundary);
    let closing = format!("--{}--", boundary);

    let mut current: Vec<&str> = Vec::new();
    let mut in_part = false;

    for line in body.split("\r\n") {
        if line == closing.as_str() {
            if in_part {
                process_part(&current, parsed)?;
            }
            break;
        }
        if line == delimiter.as_str() {
            if in_part {
                process_part(&current, parsed)?;
            }
            current.clear();
            in_part = true;
            continue;
        }
        if in_part {
            current.push(line);
        }
    }

    Ok(())
}

fn process_part(lines: &[&str], parsed: &mut ParsedMail) -> Result<()> {
    let raw = lines.join("\r\n");
    let (headers, content) = split_headers(&raw);

    let disposition = header_value(&headers, "Content-Disposition").unwrap_or_default();
    if disposition.to_ascii_lowercase().starts_with("attachment") {
        let filename = disposition
            .split(';')
            .find_map(|param| param.trim().strip_prefix("filename="))
            .map(|name| name.trim_matches('"').to_string())
            .unwrap_or_default();
        let content_type = header_value(&headers, "Content-Type")
            .unwrap_or_else(|| "application/octet-stream".to_string());

        let encoded: String = content.split_whitespace().collect();
        let payload = BASE64
            .decode(encoded.as_bytes())
            .map_err(|e| MailError::Parse(format!("Invalid attachment base64: {}", e)))?;

        parsed.attachments.push(Attachment {
            content_type,
            filename,
            payload,
        });
    } else if parsed.body.is_empty() {
        // First non-attachment part becomes the body
        parsed.body = content.to_string();
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_message() {
        let parsed = parse("Subject: hi\r\n\r\nhello\r\n").unwrap();
        assert_eq!(parsed.subject, "hi");
        assert_eq!(parsed.body, "hello\r\n");
        assert!(parsed.attachments.is_empty());
    }

    #[test]
    fn test_parse_no_headers() {
        let parsed = parse("just a body line\r\n").unwrap();
        assert_eq!(parsed.subject, "");
        assert_eq!(parsed.body, "just a body line\r\n");
    }

    #[test]
    fn test_header_lookup_is_case_insensitive() {
        let parsed = parse("SUBJECT: shouting\r\n\r\nbody\r\n").unwrap();
        assert_eq!(parsed.subject, "shouting");
    }

    #[test]
    fn test_parse_multipart_with_attachment() {
        let payload = BASE64.encode(b"attached bytes");
        let data = format!(
            "Subject: report\r\n\
             Content-Type: multipart/mixed; boundary=\"sep\"\r\n\
             \r\n\
             --sep\r\n\
             Content-Type: text/plain\r\n\
             \r\n\
             see attached\r\n\
             --sep\r\n\
             Content-Type: application/pdf\r\n\
             Content-Disposition: attachment; filename=\"report.pdf\"\r\n\
             Content-Transfer-Encoding: base64\r\n\
             \r\n\
             {}\r\n\
             --sep--\r\n",
            payload
        );

        let parsed = parse(&data).unwrap();
        assert_eq!(parsed.subject, "report");
        assert_eq!(parsed.body, "see attached");
        assert_eq!(parsed.attachments.len(), 1);
        assert_eq!(parsed.attachments[0].filename, "report.pdf");
        assert_eq!(parsed.attachments[0].content_type, "application/pdf");
        assert_eq!(parsed.attachments[0].payload, b"attached bytes");
    }

    #[test]
    fn test_bad_attachment_base64_is_rejected() {
        let data = "Content-Type: multipart/mixed; boundary=b\r\n\
                    \r\n\
                    --b\r\n\
                    Content-Disposition: attachment; filename=\"x\"\r\n\
                    \r\n\
                    %%%not-base64%%%\r\n\
                    --b--\r\n";
        assert!(parse(data).is_err());
    }
}
