use std::collections::BTreeMap;
use std::fmt;

use reqwest::Method;

/// A route independent of its concrete parameter values, e.g.
/// `POST /channels/{channel_id}/messages`.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct RouteKey(String);

impl RouteKey {
    #[must_use]
    pub fn new(method: &Method, template: &str) -> Self {
        Self(format!("{method} {template}"))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RouteKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Parameter values that split one route into independent quotas, such as the id of
/// the parent resource.
#[derive(Clone, Debug, Default, Eq, Hash, PartialEq)]
pub struct MajorParams(BTreeMap<String, String>);

impl MajorParams {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<K: Into<String>, V: Into<String>>(&mut self, name: K, value: V) {
        self.0.insert(name.into(), value.into());
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for MajorParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (name, value)) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{name}={value}")?;
        }
        Ok(())
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for MajorParams {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

/// The server-side identity of a bucket.
#[non_exhaustive]
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub enum BucketHash {
    /// Placeholder used until the server names the bucket for this route.
    Unlimited(RouteKey),
    /// Hash reported in `X-RateLimit-Bucket`.
    Known(String),
}

impl BucketHash {
    #[must_use]
    pub fn is_unlimited(&self) -> bool {
        matches!(self, BucketHash::Unlimited(_))
    }
}

impl fmt::Display for BucketHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BucketHash::Unlimited(route) => write!(f, "unlimited+{route}"),
            BucketHash::Known(hash) => f.write_str(hash),
        }
    }
}

#[non_exhaustive]
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct BucketId {
    pub hash: BucketHash,
    pub major: MajorParams,
}

impl BucketId {
    #[must_use]
    pub fn new(hash: BucketHash, major: MajorParams) -> Self {
        Self { hash, major }
    }
}

impl fmt::Display for BucketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.major.is_empty() {
            write!(f, "{}", self.hash)
        } else {
            write!(f, "{}:{}", self.hash, self.major)
        }
    }
}
