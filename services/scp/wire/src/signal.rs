//! Named, tagged markers carried inside an exchange body.

use crate::error::WireError;
use crate::params::Parameters;
use std::fmt;
use std::str::FromStr;

/// Signal tags share the parameter map representation
pub type Tags = Parameters;

/// Body signal: `EVENT` optionally followed by `%KEY=VALUE&...`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signal {
    /// Event name
    pub event: String,
    /// Ordered tags
    pub tags: Tags,
}

impl Signal {
    /// Create a signal without tags
    pub fn new(event: impl Into<String>) -> Self {
        Self {
            event: event.into(),
            tags: Tags::new(),
        }
    }

    /// Replace the tags
    pub fn with_tags(mut self, tags: Tags) -> Self {
        self.tags = tags;
        self
    }

    /// Get a tag
    pub fn get(&self, key: &str) -> Option<&str> {
        self.tags.get(key)
    }

    /// Check that the text form parses back into this signal.
    ///
    /// The event must be non-empty and free of `%`; tags follow
    /// [`Parameters::validate_entry`].
    pub fn validate(&self) -> Result<(), WireError> {
        if self.event.is_empty() {
            return Err(WireError::Signal("empty event".to_string()));
        }
        if self.event.contains('%') {
            return Err(WireError::Reserved(format!("event {:?}", self.event)));
        }
        self.tags.validate()
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.event)?;
        if !self.tags.is_empty() {
            write!(f, "%{}", self.tags)?;
        }
        Ok(())
    }
}

impl FromStr for Signal {
    type Err = WireError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (event, tags) = match s.split_once('%') {
            Some((event, tags)) => (
                event,
                Tags::parse(tags)
                    .ok_or_else(|| WireError::Signal(format!("malformed tags in {:?}", s)))?,
            ),
            None => (s, Tags::new()),
        };

        if event.is_empty() {
            return Err(WireError::Signal(format!("empty event in {:?}", s)));
        }

        Ok(Signal {
            event: event.to_string(),
            tags,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_round_trip() {
        let cases = vec![
            Signal::new("PING"),
            Signal::new("commit").with_tags(Tags::new().with("tx", "42").with("phase", "2")),
            Signal::new("x").with_tags(Tags::new().with("empty", "")),
        ];
        for signal in cases {
            let text = signal.to_string();
            assert_eq!(text.parse::<Signal>().unwrap(), signal, "{}", text);
        }
    }

    #[test]
    fn test_signal_round_trip_with_delimiters_in_tags() {
        let signal = Signal::new("ev:1#x")
            .with_tags(Tags::new().with("k", "50%=half").with("at", "12:00#utc"));
        signal.validate().unwrap();
        assert_eq!(signal.to_string().parse::<Signal>().unwrap(), signal);
    }

    #[test]
    fn test_signal_validate_rejects_delimiters() {
        let joined = Signal::new("ev").with_tags(Tags::new().with("k", "a&b"));
        assert!(matches!(joined.validate(), Err(WireError::Reserved(_))));
        assert!(Signal::new("50%").validate().is_err());
        assert!(Signal::new("").validate().is_err());
    }

    #[test]
    fn test_signal_text_form() {
        let signal = Signal::new("ready").with_tags(Tags::new().with("a", "1").with("b", "2"));
        assert_eq!(signal.to_string(), "ready%a=1&b=2");
        assert_eq!(Signal::new("ready").to_string(), "ready");
    }

    #[test]
    fn test_signal_parse_errors() {
        assert!("".parse::<Signal>().is_err());
        assert!("%a=1".parse::<Signal>().is_err());
        assert!("ev%a".parse::<Signal>().is_err());
    }
}
