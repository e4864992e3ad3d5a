use cookie::Cookie;
use hyper::{header::COOKIE, Request};
use serde::Deserialize;
use std::{
  collections::hash_map::DefaultHasher,
  hash::{Hash, Hasher},
  net::{IpAddr, SocketAddr},
};

/// Whatever the hash strategies should stick to: a client address, a header value, a cookie...
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestKey(Vec<u8>);

impl RequestKey {
  pub fn from_bytes<B: Into<Vec<u8>>>(bytes: B) -> RequestKey {
    RequestKey(bytes.into())
  }

  pub fn as_bytes(&self) -> &[u8] {
    &self.0
  }

  pub fn hash_value(&self) -> u64 {
    // finish() does not reset state, so we'll need a new hasher for each key
    let mut hasher = DefaultHasher::new();
    self.0.hash(&mut hasher);
    hasher.finish()
  }
}

impl From<&str> for RequestKey {
  fn from(key: &str) -> Self {
    RequestKey(key.as_bytes().to_vec())
  }
}

impl From<String> for RequestKey {
  fn from(key: String) -> Self {
    RequestKey(key.into_bytes())
  }
}

impl From<IpAddr> for RequestKey {
  fn from(ip: IpAddr) -> Self {
    match ip {
      IpAddr::V4(ip) => RequestKey(ip.octets().to_vec()),
      IpAddr::V6(ip) => RequestKey(ip.octets().to_vec()),
    }
  }
}

/// Where the host proxy takes the request key from
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub enum KeyExtractor {
  ClientIp,
  Header(String),
  Cookie(String),
}

impl KeyExtractor {
  pub fn extract<B>(&self, request: &Request<B>, client_address: &SocketAddr) -> Option<RequestKey> {
    match self {
      KeyExtractor::ClientIp => Some(client_address.ip().into()),
      KeyExtractor::Header(name) => request
        .headers()
        .get(name.as_str())
        .map(|value| RequestKey::from_bytes(value.as_bytes())),
      KeyExtractor::Cookie(name) => find_cookie(request, name).map(RequestKey::from),
    }
  }
}

fn find_cookie<B>(request: &Request<B>, name: &str) -> Option<String> {
  request
    .headers()
    .get_all(COOKIE)
    .iter()
    .filter_map(|header| header.to_str().ok())
    .flat_map(|header| header.split(';'))
    .find_map(|cookie_str| {
      let cookie = Cookie::parse(cookie_str.trim()).ok()?;
      if cookie.name() == name {
        Some(cookie.value().to_string())
      } else {
        None
      }
    })
}

#[cfg(test)]
mod tests {
  use super::*;
  use hyper::Body;

  fn client() -> SocketAddr {
    "192.168.0.4:3000".parse().unwrap()
  }

  #[test]
  fn extract_client_ip() {
    let request = Request::builder().body(Body::empty()).unwrap();
    let other_port: SocketAddr = "192.168.0.4:4000".parse().unwrap();

    let key = KeyExtractor::ClientIp.extract(&request, &client());

    assert_eq!(key, Some(RequestKey::from_bytes(vec![192, 168, 0, 4])));
    assert_eq!(KeyExtractor::ClientIp.extract(&request, &other_port), key);
  }

  #[test]
  fn extract_header() {
    let request = Request::builder()
      .header("x-user", "alice")
      .body(Body::empty())
      .unwrap();
    let extractor = KeyExtractor::Header("x-user".into());

    assert_eq!(extractor.extract(&request, &client()), Some(RequestKey::from("alice")));
    assert_eq!(
      KeyExtractor::Header("x-tenant".into()).extract(&request, &client()),
      None
    );
  }

  #[test]
  fn extract_cookie() {
    let request = Request::builder()
      .header(COOKIE, "theme=dark; session=abc123")
      .body(Body::empty())
      .unwrap();
    let extractor = KeyExtractor::Cookie("session".into());

    assert_eq!(extractor.extract(&request, &client()), Some(RequestKey::from("abc123")));
  }

  #[test]
  fn missing_cookie() {
    let request = Request::builder()
      .header(COOKIE, "theme=dark")
      .body(Body::empty())
      .unwrap();
    let extractor = KeyExtractor::Cookie("session".into());

    assert_eq!(extractor.extract(&request, &client()), None);
  }

  #[test]
  fn equal_keys_hash_equally() {
    assert_eq!(
      RequestKey::from("alice").hash_value(),
      RequestKey::from(String::from("alice")).hash_value()
    );
    assert_ne!(RequestKey::from("alice").hash_value(), RequestKey::from("bob").hash_value());
  }
}
