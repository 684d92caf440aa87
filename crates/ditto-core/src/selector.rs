use std::{fmt, str::FromStr};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Ordered path segments, parsed from `/a/b/c`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Pointer {
    segments: Vec<String>,
}

impl Pointer {
    pub fn root() -> Self {
        Self::default()
    }

    /// Parse a slash separated path. Empty segments are dropped.
    pub fn parse(path: &str) -> Self {
        Self {
            segments: path
                .split('/')
                .filter(|segment| !segment.is_empty())
                .map(str::to_owned)
                .collect(),
        }
    }

    pub fn from_segments<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            segments: segments.into_iter().map(Into::into).collect(),
        }
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn get(&self, level: usize) -> Option<&str> {
        self.segments.get(level).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Concatenate `other` below this pointer.
    pub fn join(&self, other: &Pointer) -> Pointer {
        let mut segments = self.segments.clone();
        segments.extend(other.segments.iter().cloned());
        Pointer { segments }
    }
}

impl fmt::Display for Pointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.segments.is_empty() {
            return f.write_str("/");
        }
        for segment in &self.segments {
            write!(f, "/{segment}")?;
        }
        Ok(())
    }
}

impl FromStr for Pointer {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::parse(s))
    }
}

impl Serialize for Pointer {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Pointer {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(Self::parse(&raw))
    }
}

/// A segment of the form `{name}` matches any concrete segment at its level.
pub fn is_placeholder(segment: &str) -> bool {
    segment.len() >= 2 && segment.starts_with('{') && segment.ends_with('}')
}

/// Prefix match of `target` against `template`.
///
/// An empty target matches every template. An empty template matches no
/// non-empty target. Otherwise every template level must be present in the
/// target and be equal to it or a placeholder. Target segments below the
/// template's depth are ignored.
pub fn matches(template: &Pointer, target: &Pointer) -> bool {
    if target.is_empty() {
        return true;
    }
    if template.is_empty() {
        return false;
    }
    template
        .segments
        .iter()
        .enumerate()
        .all(|(level, expected)| match target.get(level) {
            Some(actual) => expected == actual || is_placeholder(expected),
            None => false,
        })
}

/// Routes change notifications by resource pointer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Selector {
    template: Option<Pointer>,
}

impl Selector {
    pub fn new(template: Pointer) -> Self {
        Self {
            template: Some(template),
        }
    }

    pub fn parse(template: &str) -> Self {
        Self::new(Pointer::parse(template))
    }

    /// Sentinel that matches nothing, not even the empty pointer.
    pub fn never() -> Self {
        Self { template: None }
    }

    pub fn is_never(&self) -> bool {
        self.template.is_none()
    }

    pub fn template(&self) -> Option<&Pointer> {
        self.template.as_ref()
    }

    pub fn matches(&self, target: &Pointer) -> bool {
        match &self.template {
            Some(template) => matches(template, target),
            None => false,
        }
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.template {
            Some(template) => template.fmt(f),
            None => f.write_str("<never>"),
        }
    }
}
