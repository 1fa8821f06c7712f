// auth.rs - Digest authentication (RFC 2617) for challenged requests

use std::fmt::{self, Write as _};
use std::str::FromStr;

use md5::{Digest, Md5};
#[cfg(feature = "serialization")]
use serde::{Deserialize, Serialize};

use crate::{Credentials, Result, SipError, SipMessage};

const DEFAULT_ALGORITHM: &str = "MD5";

/// A `WWW-Authenticate` / `Proxy-Authenticate` digest challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serialization", derive(Serialize, Deserialize))]
pub struct DigestChallenge {
    pub realm: String,
    pub nonce: String,
    pub opaque: Option<String>,
    pub stale: bool,
    pub algorithm: String,
    pub qop: Option<Vec<String>>,
}

impl DigestChallenge {
    pub fn new(realm: &str, nonce: &str) -> Self {
        DigestChallenge {
            realm: realm.to_string(),
            nonce: nonce.to_string(),
            opaque: None,
            stale: false,
            algorithm: DEFAULT_ALGORITHM.to_string(),
            qop: None,
        }
    }

    pub fn with_qop(mut self, qop: &[&str]) -> Self {
        self.qop = Some(qop.iter().map(|q| q.to_string()).collect());
        self
    }

    fn offers_auth(&self) -> bool {
        self.qop
            .as_ref()
            .is_some_and(|options| options.iter().any(|q| q == "auth"))
    }

    fn check(&self) -> Result<()> {
        if self.realm.is_empty() || self.nonce.is_empty() {
            return Err(SipError::Authentication(
                "challenge without realm or nonce".to_string(),
            ));
        }
        if self.algorithm.eq_ignore_ascii_case("MD5")
            || self.algorithm.eq_ignore_ascii_case("MD5-sess")
        {
            Ok(())
        } else {
            Err(SipError::Authentication(format!(
                "unsupported algorithm: {}",
                self.algorithm
            )))
        }
    }
}

impl fmt::Display for DigestChallenge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Digest realm={}, nonce={}",
            Quoted(&self.realm),
            Quoted(&self.nonce)
        )?;
        if self.algorithm != DEFAULT_ALGORITHM {
            write!(f, ", algorithm={}", self.algorithm)?;
        }
        if let Some(ref opaque) = self.opaque {
            write!(f, ", opaque={}", Quoted(opaque))?;
        }
        if self.stale {
            f.write_str(", stale=true")?;
        }
        if let Some(ref qop) = self.qop {
            write!(f, ", qop={}", Quoted(&qop.join(",")))?;
        }
        Ok(())
    }
}

impl FromStr for DigestChallenge {
    type Err = SipError;

    fn from_str(s: &str) -> Result<Self> {
        let mut params = DigestParams::parse(s)?;
        Ok(DigestChallenge {
            realm: params.required("realm")?,
            nonce: params.required("nonce")?,
            opaque: params.take("opaque"),
            stale: params
                .take("stale")
                .is_some_and(|stale| stale.eq_ignore_ascii_case("true")),
            algorithm: params.algorithm(),
            qop: params
                .take("qop")
                .map(|qop| qop.split(',').map(|q| q.trim().to_string()).collect()),
        })
    }
}

/// The `Authorization` answer to a [`DigestChallenge`].
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serialization", derive(Serialize, Deserialize))]
pub struct DigestCredentials {
    pub username: String,
    pub realm: String,
    pub nonce: String,
    pub uri: String,
    pub response: String,
    pub algorithm: String,
    pub cnonce: Option<String>,
    pub opaque: Option<String>,
    pub qop: Option<String>,
    pub nc: Option<String>,
}

impl DigestCredentials {
    /// Server side: recomputes the response for `method` with `password`.
    pub fn verify(&self, password: &str, method: &str) -> bool {
        let expected = ResponseInput {
            username: &self.username,
            password,
            realm: &self.realm,
            algorithm: &self.algorithm,
            nonce: &self.nonce,
            method,
            uri: &self.uri,
            qop: self.qop.as_deref(),
            nc: self.nc.as_deref(),
            cnonce: self.cnonce.as_deref(),
        }
        .response();
        expected == self.response
    }
}

impl fmt::Display for DigestCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Digest username={}, realm={}, nonce={}, uri={}, response={}",
            Quoted(&self.username),
            Quoted(&self.realm),
            Quoted(&self.nonce),
            Quoted(&self.uri),
            Quoted(&self.response)
        )?;
        if self.algorithm != DEFAULT_ALGORITHM {
            write!(f, ", algorithm={}", self.algorithm)?;
        }
        if let Some(ref cnonce) = self.cnonce {
            write!(f, ", cnonce={}", Quoted(cnonce))?;
        }
        if let Some(ref opaque) = self.opaque {
            write!(f, ", opaque={}", Quoted(opaque))?;
        }
        if let Some(ref qop) = self.qop {
            write!(f, ", qop={}", qop)?;
        }
        if let Some(ref nc) = self.nc {
            write!(f, ", nc={}", nc)?;
        }
        Ok(())
    }
}

impl FromStr for DigestCredentials {
    type Err = SipError;

    fn from_str(s: &str) -> Result<Self> {
        let mut params = DigestParams::parse(s)?;
        Ok(DigestCredentials {
            username: params.required("username")?,
            realm: params.required("realm")?,
            nonce: params.required("nonce")?,
            uri: params.required("uri")?,
            response: params.required("response")?,
            algorithm: params.algorithm(),
            cnonce: params.take("cnonce"),
            opaque: params.take("opaque"),
            qop: params.take("qop"),
            nc: params.take("nc"),
        })
    }
}

/// Client side state for one account: who we are, and how many times the
/// current nonce has been used.
#[derive(Debug, Clone)]
pub struct AuthContext {
    credentials: Credentials,
    nonce: Option<String>,
    nonce_count: u32,
    cnonce: String,
}

impl AuthContext {
    pub fn new(credentials: &Credentials) -> Self {
        AuthContext {
            credentials: credentials.clone(),
            nonce: None,
            nonce_count: 0,
            cnonce: generate_cnonce(),
        }
    }

    pub fn username(&self) -> &str {
        &self.credentials.username
    }

    /// Answers `challenge` for `request`, consuming one nonce count.
    pub fn authorize(
        &mut self,
        challenge: &DigestChallenge,
        request: &SipMessage,
    ) -> Result<DigestCredentials> {
        challenge.check()?;
        let method = request
            .method()
            .ok_or_else(|| SipError::InvalidState("cannot authorize a response".to_string()))?;
        let uri = request
            .request_uri()
            .ok_or_else(|| SipError::InvalidState("request has no URI".to_string()))?
            .to_string();

        // A new nonce restarts the count; a stale one keeps it going
        if self.nonce.as_deref() != Some(challenge.nonce.as_str()) && !challenge.stale {
            self.nonce_count = 0;
            self.cnonce = generate_cnonce();
        }
        self.nonce = Some(challenge.nonce.clone());
        self.nonce_count += 1;

        let with_qop = challenge.offers_auth();
        let qop = with_qop.then(|| "auth".to_string());
        let nc = with_qop.then(|| format!("{:08x}", self.nonce_count));
        let cnonce = with_qop.then(|| self.cnonce.clone());

        let response = ResponseInput {
            username: &self.credentials.username,
            password: &self.credentials.password,
            realm: &challenge.realm,
            algorithm: &challenge.algorithm,
            nonce: &challenge.nonce,
            method: method.as_str(),
            uri: &uri,
            qop: qop.as_deref(),
            nc: nc.as_deref(),
            cnonce: cnonce.as_deref(),
        }
        .response();

        Ok(DigestCredentials {
            username: self.credentials.username.clone(),
            realm: challenge.realm.clone(),
            nonce: challenge.nonce.clone(),
            uri,
            response,
            algorithm: challenge.algorithm.clone(),
            cnonce,
            opaque: challenge.opaque.clone(),
            qop,
            nc,
        })
    }
}

struct ResponseInput<'a> {
    username: &'a str,
    password: &'a str,
    realm: &'a str,
    algorithm: &'a str,
    nonce: &'a str,
    method: &'a str,
    uri: &'a str,
    qop: Option<&'a str>,
    nc: Option<&'a str>,
    cnonce: Option<&'a str>,
}

impl ResponseInput<'_> {
    fn ha1(&self) -> String {
        let secret = md5_hex(&format!("{}:{}:{}", self.username, self.realm, self.password));
        if self.algorithm.eq_ignore_ascii_case("MD5-sess") {
            md5_hex(&format!(
                "{}:{}:{}",
                secret,
                self.nonce,
                self.cnonce.unwrap_or_default()
            ))
        } else {
            secret
        }
    }

    fn response(&self) -> String {
        let ha1 = self.ha1();
        let ha2 = md5_hex(&format!("{}:{}", self.method, self.uri));
        match self.qop {
            Some(qop) => md5_hex(&format!(
                "{}:{}:{}:{}:{}:{}",
                ha1,
                self.nonce,
                self.nc.unwrap_or("00000001"),
                self.cnonce.unwrap_or_default(),
                qop,
                ha2
            )),
            // RFC 2069 compatibility
            None => md5_hex(&format!("{}:{}:{}", ha1, self.nonce, ha2)),
        }
    }
}

/// `key=value` pairs after the `Digest` scheme, values optionally quoted.
struct DigestParams(Vec<(String, String)>);

impl DigestParams {
    fn parse(header: &str) -> Result<Self> {
        let rest = header
            .trim()
            .strip_prefix("Digest")
            .filter(|rest| rest.starts_with(char::is_whitespace))
            .ok_or_else(|| SipError::Authentication(format!("not a Digest header: {}", header)))?;

        let params = split_unquoted(rest, ',')
            .into_iter()
            .filter_map(|pair| {
                let (key, value) = pair.split_once('=')?;
                Some((key.trim().to_ascii_lowercase(), unquote(value.trim())))
            })
            .collect();
        Ok(DigestParams(params))
    }

    fn take(&mut self, key: &str) -> Option<String> {
        let index = self.0.iter().position(|(k, _)| k == key)?;
        Some(self.0.swap_remove(index).1)
    }

    fn required(&mut self, key: &str) -> Result<String> {
        self.take(key)
            .ok_or_else(|| SipError::Authentication(format!("missing {} parameter", key)))
    }

    fn algorithm(&mut self) -> String {
        self.take("algorithm")
            .unwrap_or_else(|| DEFAULT_ALGORITHM.to_string())
    }
}

fn split_unquoted(s: &str, separator: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut quoted = false;
    let mut escaped = false;

    for (index, ch) in s.char_indices() {
        match ch {
            _ if escaped => escaped = false,
            '\\' if quoted => escaped = true,
            '"' => quoted = !quoted,
            c if c == separator && !quoted => {
                parts.push(&s[start..index]);
                start = index + c.len_utf8();
            }
            _ => {}
        }
    }
    parts.push(&s[start..]);
    parts
}

fn unquote(value: &str) -> String {
    let Some(inner) = value.strip_prefix('"').and_then(|v| v.strip_suffix('"')) else {
        return value.to_string();
    };
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(ch) = chars.next() {
        match ch {
            '\\' => out.extend(chars.next()),
            c => out.push(c),
        }
    }
    out
}

/// A quoted-string parameter value, with `"` and `\` escaped.
struct Quoted<'a>(&'a str);

impl fmt::Display for Quoted<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_char('"')?;
        for ch in self.0.chars() {
            if matches!(ch, '"' | '\\') {
                f.write_char('\\')?;
            }
            f.write_char(ch)?;
        }
        f.write_char('"')
    }
}

fn md5_hex(data: &str) -> String {
    format!("{:x}", Md5::digest(data.as_bytes()))
}

fn generate_cnonce() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..16].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{SipMessageBuilder, SipMethod, SipUri};

    fn register() -> SipMessage {
        SipMessageBuilder::request(SipMethod::Register, SipUri::new("example.com"))
            .call_id("reg-1")
            .from(SipUri::with_user("alice", "example.com"), Some("t"))
            .build()
            .unwrap()
    }

    #[test]
    fn test_parse_challenge() {
        let header =
            r#"Digest realm="asterisk", nonce="1234567890", algorithm=MD5, qop="auth,auth-int""#;
        let challenge: DigestChallenge = header.parse().unwrap();

        assert_eq!(challenge.realm, "asterisk");
        assert_eq!(challenge.nonce, "1234567890");
        assert_eq!(challenge.algorithm, "MD5");
        assert_eq!(
            challenge.qop,
            Some(vec!["auth".to_string(), "auth-int".to_string()])
        );
        assert!(challenge.offers_auth());

        let reparsed: DigestChallenge = challenge.to_string().parse().unwrap();
        assert_eq!(reparsed, challenge);
        assert!(r#"Basic realm="x""#.parse::<DigestChallenge>().is_err());
        assert!(r#"Digest nonce="x""#.parse::<DigestChallenge>().is_err());
    }

    #[test]
    fn test_quoted_comma_and_escapes() {
        let challenge: DigestChallenge =
            r#"Digest realm="a, \"b\"", nonce="n", opaque="x,y""#.parse().unwrap();
        assert_eq!(challenge.realm, r#"a, "b""#);
        assert_eq!(challenge.opaque.as_deref(), Some("x,y"));
    }

    #[test]
    fn test_quotes_escaped_on_output() {
        let mut challenge = DigestChallenge::new(r#"say "hi" \ realm"#, r#"n"1"#);
        challenge.opaque = Some(r#"o", stale=true"#.to_string());
        let header = challenge.to_string();
        assert!(header.contains(r#"realm="say \"hi\" \\ realm""#));
        let reparsed: DigestChallenge = header.parse().unwrap();
        assert!(!reparsed.stale);
        assert_eq!(reparsed, challenge);

        let mut ctx = AuthContext::new(&Credentials::new("bob", "pw"));
        let creds = ctx.authorize(&challenge, &register()).unwrap();
        let parsed: DigestCredentials = creds.to_string().parse().unwrap();
        assert_eq!(parsed.realm, challenge.realm);
        assert_eq!(parsed.nonce, challenge.nonce);
        assert!(parsed.verify("pw", "REGISTER"));
    }

    #[test]
    fn test_md5_known_answer() {
        assert_eq!(md5_hex(""), "d41d8cd98f00b204e9800998ecf8427e");
        assert_eq!(md5_hex("abc"), "900150983cd24fb0d6963f7d28e17f72");
    }

    #[test]
    fn test_rfc2617_example() {
        // Section 3.5 of RFC 2617
        let input = ResponseInput {
            username: "Mufasa",
            password: "Circle Of Life",
            realm: "testrealm@host.com",
            algorithm: "MD5",
            nonce: "dcd98b7102dd2f0e8b11d0f600bfb0c093",
            method: "GET",
            uri: "/dir/index.html",
            qop: Some("auth"),
            nc: Some("00000001"),
            cnonce: Some("0a4f113b"),
        };
        assert_eq!(input.response(), "6629fae49393a05397450978507c4ef1");
    }

    #[test]
    fn test_authorize_and_verify() {
        let mut ctx = AuthContext::new(&Credentials::new("alice", "secret"));
        let challenge = DigestChallenge::new("example.com", "n0nce").with_qop(&["auth"]);

        let creds = ctx.authorize(&challenge, &register()).unwrap();
        assert_eq!(creds.nc.as_deref(), Some("00000001"));
        assert_eq!(creds.uri, "sip:example.com");
        assert!(creds.verify("secret", "REGISTER"));
        assert!(!creds.verify("wrong", "REGISTER"));
        assert!(!creds.verify("secret", "INVITE"));

        let again = ctx.authorize(&challenge, &register()).unwrap();
        assert_eq!(again.nc.as_deref(), Some("00000002"));
        assert_eq!(again.cnonce, creds.cnonce);

        // A different nonce starts counting again
        let fresh = DigestChallenge::new("example.com", "other").with_qop(&["auth"]);
        let third = ctx.authorize(&fresh, &register()).unwrap();
        assert_eq!(third.nc.as_deref(), Some("00000001"));
    }

    #[test]
    fn test_authorization_header_round_trip() {
        let mut ctx = AuthContext::new(&Credentials::new("bob", "pw"));
        let creds = ctx
            .authorize(&DigestChallenge::new("example.com", "abc"), &register())
            .unwrap();

        let header = creds.to_string();
        assert!(header.starts_with("Digest "));
        assert!(header.contains(r#"username="bob""#));
        assert!(!header.contains("qop"));

        let parsed: DigestCredentials = header.parse().unwrap();
        assert_eq!(parsed, creds);
        assert!(parsed.verify("pw", "REGISTER"));
    }

    #[test]
    fn test_unsupported_algorithm() {
        let mut challenge = DigestChallenge::new("example.com", "abc");
        challenge.algorithm = "SHA-512-256".to_string();
        let mut ctx = AuthContext::new(&Credentials::new("bob", "pw"));
        assert!(matches!(
            ctx.authorize(&challenge, &register()),
            Err(SipError::Authentication(_))
        ));
    }
}
