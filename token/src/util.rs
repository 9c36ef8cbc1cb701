use std::str;

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref AUTHORIZATION_REGEX: Regex =
        Regex::new(r"^(?i)((?P<bearer>bearer)|(?P<basic>basic))(?-i) (?P<rest>(.*))$").unwrap();
}

/// Extracts a token from an Authorization header.
///
/// Bearer tokens are returned as-is; for Basic Auth the password is
/// returned and the username is ignored.
pub fn parse_authorization_header(authorization: &str) -> Option<String> {
    let captures = AUTHORIZATION_REGEX.captures(authorization)?;
    let rest = captures.name("rest").unwrap().as_str();

    if captures.name("bearer").is_some() {
        // Bearer token
        Some(rest.to_string())
    } else {
        // Basic auth
        let (_, pass) = parse_basic_auth(authorization)?;
        Some(pass)
    }
}

/// Extracts the username and password from a Basic Auth header.
pub fn parse_basic_auth(authorization: &str) -> Option<(String, String)> {
    let captures = AUTHORIZATION_REGEX.captures(authorization)?;
    captures.name("basic")?;

    let rest = captures.name("rest").unwrap().as_str();
    let bytes = BASE64_STANDARD.decode(rest).ok()?;

    let user_pass = str::from_utf8(&bytes).ok()?;
    let colon = user_pass.find(':')?;

    Some((
        user_pass[..colon].to_string(),
        user_pass[colon + 1..].to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_authorization_header() {
        assert_eq!(
            "somepass",
            parse_authorization_header("Basic c29tZXVzZXI6c29tZXBhc3M=").unwrap(),
        );

        assert_eq!(
            "somepass",
            parse_authorization_header("baSIC c29tZXVzZXI6c29tZXBhc3M=").unwrap(),
        );

        assert_eq!(
            "some-token",
            parse_authorization_header("bearer some-token").unwrap(),
        );
    }

    #[test]
    fn test_parse_basic_auth() {
        let (user, pass) = parse_basic_auth("Basic c29tZXVzZXI6c29tZXBhc3M=").unwrap();
        assert_eq!(user, "someuser");
        assert_eq!(pass, "somepass");

        assert!(parse_basic_auth("Bearer some-token").is_none());
    }
}
