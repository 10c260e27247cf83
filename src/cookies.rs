//! Cookie extraction for captured exchanges.
use http::header::{COOKIE, SET_COOKIE};
use http::{HeaderMap, HeaderValue};
use serde::ser::SerializeStruct;
use std::time::SystemTime;

/// A cookie seen in a `Cookie` or `Set-Cookie` header.
#[derive(Debug, Clone, PartialEq)]
pub struct Cookie<'a>(cookie::Cookie<'a>);

impl<'a> Cookie<'a> {
  fn parse(value: &'a HeaderValue) -> Result<Cookie<'a>, cookie::ParseError> {
    std::str::from_utf8(value.as_bytes())
      .map_err(cookie::ParseError::from)
      .and_then(cookie::Cookie::parse)
      .map(Cookie)
  }

  /// Detach the cookie from the header it was parsed from.
  pub fn into_owned(self) -> Cookie<'static> {
    Cookie(self.0.into_owned())
  }

  /// cookie name
  pub fn name(&self) -> &str {
    self.0.name()
  }

  /// cookie value
  pub fn value(&self) -> &str {
    self.0.value()
  }

  /// `HttpOnly` attribute
  pub fn http_only(&self) -> bool {
    self.0.http_only().unwrap_or(false)
  }

  /// `Secure` attribute
  pub fn secure(&self) -> bool {
    self.0.secure().unwrap_or(false)
  }

  /// `Path` attribute
  pub fn path(&self) -> Option<&str> {
    self.0.path()
  }

  /// `Domain` attribute
  pub fn domain(&self) -> Option<&str> {
    self.0.domain()
  }

  /// `Max-Age` attribute; negative ages read as zero.
  pub fn max_age(&self) -> Option<std::time::Duration> {
    self
      .0
      .max_age()
      .map(|d| d.try_into().unwrap_or(std::time::Duration::ZERO))
  }

  /// `Expires` attribute, `None` for session cookies.
  pub fn expires(&self) -> Option<SystemTime> {
    match self.0.expires() {
      Some(cookie::Expiration::DateTime(offset)) => Some(SystemTime::from(offset)),
      None | Some(cookie::Expiration::Session) => None,
    }
  }
}

impl serde::Serialize for Cookie<'_> {
  fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
  where
    S: serde::Serializer,
  {
    let mut state = serializer.serialize_struct("Cookie", 7)?;
    state.serialize_field("name", self.name())?;
    state.serialize_field("value", self.value())?;
    state.serialize_field("path", &self.path())?;
    state.serialize_field("domain", &self.domain())?;
    state.serialize_field("max_age", &self.max_age().map(|d| d.as_secs()))?;
    state.serialize_field("secure", &self.secure())?;
    state.serialize_field("http_only", &self.http_only())?;
    state.end()
  }
}

pub(crate) fn extract_response_cookies(
  headers: &HeaderMap,
) -> impl Iterator<Item = Result<Cookie<'_>, cookie::ParseError>> {
  headers.get_all(SET_COOKIE).iter().map(Cookie::parse)
}

/// Name/value pairs from every `Cookie` request header.
pub(crate) fn extract_request_cookies(headers: &HeaderMap) -> Vec<Cookie<'static>> {
  headers
    .get_all(COOKIE)
    .iter()
    .filter_map(|value| value.to_str().ok())
    .flat_map(|value| cookie::Cookie::split_parse(value.to_string()))
    .filter_map(|c| c.ok())
    .map(Cookie)
    .collect()
}
