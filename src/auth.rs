//! Account login for the PM channel
//!
//! The PM server accepts a session token taken from the `auth.chatango.com`
//! cookie that the login form sets. The request is blocking, so the manager
//! runs [`fetch_auth_token`] on the worker pool.

use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, warn};

use crate::error::ChatError;

static AUTH_COOKIE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)auth\.chatango\.com ?= ?([^;]*)").expect("valid regex"));

/// Login request timeout
const LOGIN_TIMEOUT: Duration = Duration::from_secs(15);

/// Pull the session token out of `Set-Cookie` header values
///
/// An empty token counts as no token.
pub fn parse_auth_cookie<'a, I>(cookies: I) -> Option<String>
where
    I: IntoIterator<Item = &'a str>,
{
    cookies.into_iter().find_map(|value| {
        let token = AUTH_COOKIE.captures(value)?.get(1)?.as_str();
        (!token.is_empty()).then(|| token.to_string())
    })
}

/// Post the login form and return the session token
///
/// `Ok(None)` means the server answered but did not hand out a token
/// (wrong credentials or an error status). Transport failures are errors.
pub fn fetch_auth_token(
    login_url: &str,
    name: &str,
    password: &str,
) -> Result<Option<String>, ChatError> {
    let agent = ureq::AgentBuilder::new()
        .redirects(0)
        .timeout(LOGIN_TIMEOUT)
        .build();

    debug!(url = login_url, user = name, "Requesting PM session token");
    let response = match agent.post(login_url).send_form(&[
        ("user_id", name),
        ("password", password),
        ("storecookie", "on"),
        ("checkerrors", "yes"),
    ]) {
        Ok(response) => response,
        Err(ureq::Error::Status(code, _)) => {
            warn!(status = code, "Login rejected");
            return Ok(None);
        }
        Err(err) => return Err(err.into()),
    };

    let token = parse_auth_cookie(response.all("set-cookie"));
    if token.is_none() {
        warn!(user = name, "Login response carried no session token");
    }
    Ok(token)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::thread;

    #[test]
    fn test_parse_auth_cookie() {
        let cookies = [
            "id.chatango.com=bot; Path=/",
            "auth.chatango.com=abc123; Domain=.chatango.com; Path=/",
        ];
        assert_eq!(parse_auth_cookie(cookies), Some("abc123".to_string()));
    }

    #[test]
    fn test_parse_auth_cookie_is_case_insensitive() {
        assert_eq!(
            parse_auth_cookie(["AUTH.Chatango.com = tok; Path=/"]),
            Some("tok".to_string())
        );
    }

    #[test]
    fn test_empty_or_missing_token() {
        assert_eq!(parse_auth_cookie(["auth.chatango.com=; Path=/"]), None);
        assert_eq!(parse_auth_cookie(["other=1"]), None);
        assert_eq!(parse_auth_cookie(std::iter::empty()), None);
    }

    /// Serve one canned HTTP response and return the request we got
    fn serve_once(response: &'static str) -> (String, thread::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}/login", listener.local_addr().unwrap());
        let handle = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = stream.read(&mut buf).unwrap();
                request.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&request);
                if let Some(head_end) = text.find("\r\n\r\n") {
                    let length = text[..head_end]
                        .lines()
                        .find_map(|l| {
                            let (k, v) = l.split_once(':')?;
                            k.eq_ignore_ascii_case("content-length")
                                .then(|| v.trim().parse::<usize>().ok())
                                .flatten()
                        })
                        .unwrap_or(0);
                    if request.len() >= head_end + 4 + length || n == 0 {
                        break;
                    }
                }
            }
            stream.write_all(response.as_bytes()).unwrap();
            String::from_utf8_lossy(&request).into_owned()
        });
        (url, handle)
    }

    #[test]
    fn test_fetch_token_from_redirect() {
        let (url, server) = serve_once(
            "HTTP/1.1 302 Found\r\nLocation: /\r\nSet-Cookie: id.chatango.com=bot\r\n\
             Set-Cookie: auth.chatango.com=tok42; Path=/\r\nContent-Length: 0\r\n\r\n",
        );
        let token = fetch_auth_token(&url, "bot", "pw").unwrap();
        assert_eq!(token.as_deref(), Some("tok42"));

        let request = server.join().unwrap();
        assert!(request.starts_with("POST /login"));
        assert!(request.contains("user_id=bot"));
        assert!(request.contains("storecookie=on"));
        assert!(request.contains("checkerrors=yes"));
    }

    #[test]
    fn test_error_status_is_no_token() {
        let (url, server) =
            serve_once("HTTP/1.1 500 Internal Server Error\r\nContent-Length: 0\r\n\r\n");
        assert_eq!(fetch_auth_token(&url, "bot", "pw").unwrap(), None);
        server.join().unwrap();
    }
}
