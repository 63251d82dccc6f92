//! Connection spec strings
//!
//! A connection spec has the form `<scheme>:<target>[?<query>]`, e.g.
//! `serial:/dev/ttyUSB0?baud=57600` or `tcp:10.0.0.5:2101`. The query is
//! `application/x-www-form-urlencoded`.

use std::fmt;
use std::str::FromStr;

use url::form_urlencoded;

use crate::error::ConnectError;

/// A parsed connection spec
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSpec {
    raw: String,
    scheme: String,
    target: String,
    params: Vec<(String, String)>,
}

impl ConnectionSpec {
    /// Parse a connection spec string
    pub fn parse(spec: &str) -> Result<Self, ConnectError> {
        let invalid = |reason: &str| ConnectError::InvalidSpec {
            spec: spec.to_string(),
            reason: reason.to_string(),
        };

        let (scheme, rest) = spec.split_once(':').ok_or_else(|| invalid("missing scheme"))?;
        if scheme.is_empty() {
            return Err(invalid("empty scheme"));
        }

        let (target, query) = match rest.split_once('?') {
            Some((target, query)) => (target, query),
            None => (rest, ""),
        };
        // Accept `tcp://host:port` as well as `tcp:host:port`
        let target = target.strip_prefix("//").unwrap_or(target);
        if target.is_empty() {
            return Err(invalid("missing target"));
        }

        let params = form_urlencoded::parse(query.as_bytes())
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();

        Ok(Self {
            raw: spec.to_string(),
            scheme: scheme.to_ascii_lowercase(),
            target: target.to_string(),
            params,
        })
    }

    /// The spec string as given
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Lowercase scheme, e.g. `serial`
    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    /// Everything between the scheme and the query
    pub fn target(&self) -> &str {
        &self.target
    }

    /// All query parameters in order of appearance
    pub fn params(&self) -> &[(String, String)] {
        &self.params
    }

    /// Raw value of a query parameter (last occurrence wins)
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .rev()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Parsed value of a query parameter
    pub fn parse_param<T: FromStr>(&self, name: &str) -> Result<Option<T>, ConnectError> {
        match self.param(name) {
            None => Ok(None),
            Some(value) => value
                .parse()
                .map(Some)
                .map_err(|_| ConnectError::InvalidParameter {
                    name: name.to_string(),
                    value: value.to_string(),
                }),
        }
    }

    /// Boolean query flag; `1`, `true` and `yes` are true
    pub fn flag(&self, name: &str) -> bool {
        matches!(
            self.param(name).map(str::to_ascii_lowercase).as_deref(),
            Some("1" | "true" | "yes")
        )
    }
}

impl fmt::Display for ConnectionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl FromStr for ConnectionSpec {
    type Err = ConnectError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Build a spec string from its scheme, target and query parameters
pub fn format_spec<'a, I>(scheme: &str, target: &str, params: I) -> String
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let query = form_urlencoded::Serializer::new(String::new())
        .extend_pairs(params)
        .finish();
    if query.is_empty() {
        format!("{}:{}", scheme, target)
    } else {
        format!("{}:{}?{}", scheme, target, query)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_serial_spec() {
        let spec = ConnectionSpec::parse("serial:/dev/ttyUSB0?baud=57600&stopbits=2").unwrap();
        assert_eq!(spec.scheme(), "serial");
        assert_eq!(spec.target(), "/dev/ttyUSB0");
        assert_eq!(spec.param("baud"), Some("57600"));
        assert_eq!(spec.parse_param::<u32>("stopbits").unwrap(), Some(2));
        assert_eq!(spec.parse_param::<u32>("parity").unwrap(), None);
    }

    #[test]
    fn test_parse_url_style_spec() {
        let spec = ConnectionSpec::parse("tcp://localhost:5760").unwrap();
        assert_eq!(spec.scheme(), "tcp");
        assert_eq!(spec.target(), "localhost:5760");
    }

    #[test]
    fn test_invalid_specs() {
        assert!(ConnectionSpec::parse("/dev/ttyUSB0").is_err());
        assert!(ConnectionSpec::parse(":foo").is_err());
        assert!(ConnectionSpec::parse("tcp:").is_err());
    }

    #[test]
    fn test_invalid_parameter() {
        let spec = ConnectionSpec::parse("serial:/dev/ttyS0?baud=fast").unwrap();
        assert!(matches!(
            spec.parse_param::<u32>("baud"),
            Err(ConnectError::InvalidParameter { .. })
        ));
    }

    #[test]
    fn test_flag() {
        let spec = ConnectionSpec::parse("file:/tmp/log.bin?autoclose=1").unwrap();
        assert!(spec.flag("autoclose"));
        assert!(!spec.flag("loop"));
    }

    #[test]
    fn test_format_spec() {
        assert_eq!(format_spec("serial", "/dev/ttyACM0", []), "serial:/dev/ttyACM0");
        assert_eq!(
            format_spec("serial", "/dev/ttyACM0", [("baud", "9600"), ("name", "a b")]),
            "serial:/dev/ttyACM0?baud=9600&name=a+b"
        );
    }
}
