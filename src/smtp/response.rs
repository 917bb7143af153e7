//! SMTP reply parsing.

use crate::error::{NetError, Result};

/// A complete SMTP reply, which may span several lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub code: u16,
    pub lines: Vec<String>,
}

impl Response {
    pub fn new(code: u16, lines: Vec<String>) -> Self {
        Self { code, lines }
    }

    /// Returns the complete message as a single string with lines joined by spaces.
    pub fn message(&self) -> String {
        self.lines.join(" ")
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.code)
    }

    /// Keywords advertised in an EHLO reply, upper-cased. The greeting line is skipped.
    pub fn capabilities(&self) -> Vec<String> {
        self.lines
            .iter()
            .skip(1)
            .map(|line| line.trim().to_ascii_uppercase())
            .filter(|line| !line.is_empty())
            .collect()
    }

    /// Parses one reply line into code, continuation flag and text.
    fn parse_line(line: &str) -> Result<(u16, bool, String)> {
        if line.len() < 3 || !line.is_char_boundary(3) {
            return Err(NetError::Protocol(format!(
                "Response line too short: '{}'",
                line
            )));
        }

        let code = line[..3]
            .parse::<u16>()
            .map_err(|_| NetError::Protocol(format!("Invalid status code: '{}'", &line[..3])))?;

        let is_last = match line[3..].chars().next() {
            None | Some(' ') => true,
            Some('-') => false,
            Some(c) => {
                return Err(NetError::Protocol(format!(
                    "Invalid separator character: '{}'",
                    c
                )))
            }
        };

        let message = line.get(4..).unwrap_or("").to_string();
        Ok((code, is_last, message))
    }

    /// Parses a complete reply from the front of `buffer`.
    ///
    /// Returns the reply and the number of bytes consumed, or `None` if more
    /// data is needed.
    pub fn parse_response(buffer: &[u8]) -> Result<Option<(Self, usize)>> {
        let mut lines = Vec::new();
        let mut first_code = None;
        let mut consumed = 0;

        while let Some(offset) = buffer[consumed..].iter().position(|&b| b == b'\n') {
            let raw = &buffer[consumed..consumed + offset];
            consumed += offset + 1;

            let text = std::str::from_utf8(raw)
                .map_err(|e| NetError::Protocol(format!("Reply is not UTF-8: {}", e)))?
                .trim_end_matches('\r');
            if text.is_empty() {
                continue;
            }

            let (code, is_last, message) = Self::parse_line(text)?;
            match first_code {
                Some(first) if first != code => {
                    return Err(NetError::Protocol(format!(
                        "Status code mismatch in multi-line response: expected {}, got {}",
                        first, code
                    )))
                }
                Some(_) => {}
                None => first_code = Some(code),
            }
            lines.push(message);

            if is_last {
                return Ok(Some((Self::new(code, lines), consumed)));
            }
        }

        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_complete_response() {
        let data = b"250 OK\r\n";
        let (response, consumed) = Response::parse_response(data).unwrap().unwrap();
        assert_eq!(response.code, 250);
        assert_eq!(response.lines, vec!["OK"]);
        assert_eq!(consumed, 8);
    }

    #[test]
    fn test_parse_multi_line_response() {
        let data = b"250-mail.example.com\r\n250-STARTTLS\r\n250 AUTH PLAIN LOGIN\r\n";
        let (response, consumed) = Response::parse_response(data).unwrap().unwrap();
        assert_eq!(response.code, 250);
        assert_eq!(
            response.capabilities(),
            vec!["STARTTLS".to_string(), "AUTH PLAIN LOGIN".to_string()]
        );
        assert_eq!(consumed, data.len());
    }

    #[test]
    fn test_parse_incomplete_response() {
        let data = b"250-mail.example.com\r\n250-SIZE";
        assert!(Response::parse_response(data).unwrap().is_none());
    }

    #[test]
    fn test_leaves_following_reply_in_buffer() {
        let data = b"220 ready\r\n250 OK\r\n";
        let (response, consumed) = Response::parse_response(data).unwrap().unwrap();
        assert_eq!(response.code, 220);
        assert_eq!(&data[consumed..], b"250 OK\r\n");
    }

    #[test]
    fn test_rejects_code_mismatch() {
        let data = b"250-first\r\n251 second\r\n";
        assert!(Response::parse_response(data).is_err());
    }

    #[test]
    fn test_classification() {
        assert!(Response::new(250, vec![]).is_success());
        assert!(!Response::new(535, vec![]).is_success());
    }
}
