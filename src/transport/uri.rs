//! Transport URI parsing
//!
//! Two shapes are understood:
//!
//! - plain transport URIs, `mock://host:port?option=value`
//! - composite URIs, `failover://(uri1,uri2,...)?option=value`, whose
//!   components are themselves transport URIs and may carry their own options

use crate::error::{TransportError, TransportResult};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use url::Url;

static COMPOSITE_URI: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?P<scheme>[a-zA-Z][a-zA-Z0-9+.\-]*):(?://)?\((?P<body>.*)\)(?:\?(?P<query>.*))?$")
        .unwrap_or_else(|e| panic!("composite URI pattern is invalid: {e}"))
});

static SCHEME_PREFIX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?P<scheme>[a-zA-Z][a-zA-Z0-9+.\-]*):(?://)?(?P<rest>.*)$")
        .unwrap_or_else(|e| panic!("scheme pattern is invalid: {e}"))
});

/// A URI naming several component transports
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompositeUri {
    pub scheme: String,
    pub components: Vec<String>,
    pub options: BTreeMap<String, String>,
}

impl CompositeUri {
    pub fn parse(input: &str) -> TransportResult<Self> {
        let input = input.trim();

        if let Some(captures) = COMPOSITE_URI.captures(input) {
            let body = &captures["body"];
            let components = split_components(body)
                .map_err(|reason| TransportError::invalid_uri(input, reason))?;
            if components.is_empty() {
                return Err(TransportError::invalid_uri(input, "no component URIs"));
            }
            let options = captures
                .name("query")
                .map(|query| parse_query(query.as_str()))
                .unwrap_or_default();

            return Ok(Self {
                scheme: captures["scheme"].to_ascii_lowercase(),
                components,
                options,
            });
        }

        // `failover:mock://a:1` names a single component with no shared options
        let captures = SCHEME_PREFIX
            .captures(input)
            .ok_or_else(|| TransportError::invalid_uri(input, "missing scheme"))?;
        let rest = &captures["rest"];
        if rest.is_empty() {
            return Err(TransportError::invalid_uri(input, "no component URIs"));
        }
        if rest.contains(['(', ')']) {
            return Err(TransportError::invalid_uri(input, "unbalanced parentheses"));
        }

        Ok(Self {
            scheme: captures["scheme"].to_ascii_lowercase(),
            components: rest
                .split(',')
                .map(str::trim)
                .filter(|c| !c.is_empty())
                .map(str::to_string)
                .collect(),
            options: BTreeMap::new(),
        })
    }
}

impl fmt::Display for CompositeUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://({})", self.scheme, self.components.join(","))?;
        if !self.options.is_empty() {
            let query: Vec<String> = self
                .options
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect();
            write!(f, "?{}", query.join("&"))?;
        }
        Ok(())
    }
}

/// Split on top-level commas, leaving nested composite URIs intact
fn split_components(body: &str) -> Result<Vec<String>, String> {
    let mut components = Vec::new();
    let mut depth = 0usize;
    let mut current = String::new();

    for ch in body.chars() {
        match ch {
            '(' => {
                depth += 1;
                current.push(ch);
            }
            ')' => {
                depth = depth
                    .checked_sub(1)
                    .ok_or_else(|| "unbalanced parentheses".to_string())?;
                current.push(ch);
            }
            ',' if depth == 0 => {
                let component = current.trim();
                if !component.is_empty() {
                    components.push(component.to_string());
                }
                current.clear();
            }
            _ => current.push(ch),
        }
    }

    if depth != 0 {
        return Err("unbalanced parentheses".to_string());
    }

    let component = current.trim();
    if !component.is_empty() {
        components.push(component.to_string());
    }

    Ok(components)
}

fn parse_query(query: &str) -> BTreeMap<String, String> {
    url::form_urlencoded::parse(query.as_bytes())
        .into_owned()
        .collect()
}

/// A single physical transport location
#[derive(Debug, Clone, PartialEq)]
pub struct TransportUri {
    raw: String,
    scheme: String,
    host: String,
    port: Option<u16>,
    options: BTreeMap<String, String>,
}

impl TransportUri {
    pub fn parse(input: &str) -> TransportResult<Self> {
        let url = Url::parse(input.trim())
            .map_err(|e| TransportError::invalid_uri(input, e.to_string()))?;
        let host = url
            .host_str()
            .filter(|host| !host.is_empty())
            .ok_or_else(|| TransportError::invalid_uri(input, "missing host"))?
            .to_string();

        Ok(Self {
            raw: input.trim().to_string(),
            scheme: url.scheme().to_string(),
            host,
            port: url.port(),
            options: url.query_pairs().into_owned().collect(),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }

    /// `host:port`, or just `host` when no port was given
    pub fn address(&self) -> String {
        match self.port {
            Some(port) => format!("{}:{}", self.host, port),
            None => self.host.clone(),
        }
    }

    pub fn options(&self) -> &BTreeMap<String, String> {
        &self.options
    }

    pub fn option(&self, key: &str) -> Option<&str> {
        self.options.get(key).map(String::as_str)
    }

    /// Boolean option, false when absent or malformed
    pub fn flag(&self, key: &str) -> bool {
        self.option(key)
            .map(|value| value.eq_ignore_ascii_case("true"))
            .unwrap_or(false)
    }
}

impl fmt::Display for TransportUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_composite_uri() {
        let uri = CompositeUri::parse(
            "failover://(mock://a:61616,mock://b:61617?name=b)?randomize=false&timeout=500",
        )
        .unwrap();

        assert_eq!(uri.scheme, "failover");
        assert_eq!(uri.components, vec!["mock://a:61616", "mock://b:61617?name=b"]);
        assert_eq!(uri.options.get("randomize").map(String::as_str), Some("false"));
        assert_eq!(uri.options.get("timeout").map(String::as_str), Some("500"));
    }

    #[test]
    fn test_parse_composite_without_slashes_or_options() {
        let uri = CompositeUri::parse("failover:(mock://a:1)").unwrap();

        assert_eq!(uri.components, vec!["mock://a:1"]);
        assert!(uri.options.is_empty());
    }

    #[test]
    fn test_parse_composite_without_parentheses() {
        let uri = CompositeUri::parse("failover:mock://a:1").unwrap();

        assert_eq!(uri.scheme, "failover");
        assert_eq!(uri.components, vec!["mock://a:1"]);
    }

    #[test]
    fn test_nested_composite_stays_whole() {
        let uri =
            CompositeUri::parse("failover://(mock://a:1,other://(mock://b:2,mock://c:3))").unwrap();

        assert_eq!(
            uri.components,
            vec!["mock://a:1", "other://(mock://b:2,mock://c:3)"]
        );
    }

    #[test]
    fn test_invalid_composite_uris() {
        assert!(CompositeUri::parse("failover://()").is_err());
        assert!(CompositeUri::parse("no scheme here").is_err());
        assert!(CompositeUri::parse("failover://(mock://a:1))(").is_err());
    }

    #[test]
    fn test_composite_display_round_trips_options() {
        let uri = CompositeUri::parse("failover://(mock://a:1,mock://b:2)?randomize=false").unwrap();
        assert_eq!(
            uri.to_string(),
            "failover://(mock://a:1,mock://b:2)?randomize=false"
        );
    }

    #[test]
    fn test_parse_transport_uri() {
        let uri = TransportUri::parse("mock://localhost:61616?failOnCreate=true&name=primary")
            .unwrap();

        assert_eq!(uri.scheme(), "mock");
        assert_eq!(uri.host(), "localhost");
        assert_eq!(uri.port(), Some(61616));
        assert_eq!(uri.address(), "localhost:61616");
        assert!(uri.flag("failOnCreate"));
        assert!(!uri.flag("failOnStart"));
        assert_eq!(uri.option("name"), Some("primary"));
        assert_eq!(uri.as_str(), "mock://localhost:61616?failOnCreate=true&name=primary");
    }

    #[test]
    fn test_transport_uri_without_port() {
        let uri = TransportUri::parse("mock://A?failOnCreate=true").unwrap();

        assert_eq!(uri.port(), None);
        assert_eq!(uri.address(), uri.host());
    }

    #[test]
    fn test_transport_uri_requires_host() {
        assert!(TransportUri::parse("mock:nohost").is_err());
        assert!(TransportUri::parse("not a uri").is_err());
    }
}
