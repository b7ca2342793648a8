use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use reqwest::Method;
use url::Url;

use super::config::Config;
use crate::Result;
use crate::error::Error;
use crate::rate_limit::{MajorParams, RouteKey};

/// A path template such as `/channels/{channel_id}/messages`.
///
/// Placeholders must span a whole `/`-separated segment.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Route(String);

impl Route {
    pub fn new<S: Into<String>>(template: S) -> Self {
        Self(template.into())
    }

    #[must_use]
    pub fn template(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn key(&self, method: &Method) -> RouteKey {
        RouteKey::new(method, &self.0)
    }

    fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('/').filter(|segment| !segment.is_empty())
    }
}

impl From<&str> for Route {
    fn from(template: &str) -> Self {
        Self::new(template)
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Concrete values for a [`Route`]'s placeholders, plus any query parameters.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Params(BTreeMap<String, String>);

impl Params {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a value, replacing any previous one with the same name.
    #[must_use]
    pub fn with<K: Into<String>, V: fmt::Display>(mut self, name: K, value: V) -> Self {
        self.insert(name, value);
        self
    }

    pub fn insert<K: Into<String>, V: fmt::Display>(&mut self, name: K, value: V) {
        self.0.insert(name.into(), value.to_string());
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }
}

/// Where a request goes and which quota it counts against.
#[derive(Debug)]
pub(crate) struct Resolved {
    pub(crate) url: Url,
    pub(crate) key: RouteKey,
    pub(crate) major: MajorParams,
}

/// Substitutes `params` into `route` under `host`.
pub(crate) fn resolve(
    host: &Url,
    method: &Method,
    route: &Route,
    params: &Params,
    config: &Config,
) -> Result<Resolved> {
    let mut url = host.clone();
    let mut used = BTreeSet::new();
    {
        let mut path = url
            .path_segments_mut()
            .map_err(|()| Error::validation(format!("{host} cannot be a base URL")))?;
        path.pop_if_empty();

        for segment in route.segments() {
            match placeholder(segment) {
                Some(name) => {
                    let value = params.get(name).ok_or_else(|| {
                        Error::validation(format!(
                            "missing value for `{name}` in route {route}"
                        ))
                    })?;
                    path.push(value);
                    used.insert(name);
                }
                None if segment.contains(['{', '}']) => {
                    return Err(Error::validation(format!(
                        "placeholder in `{segment}` must span the whole segment of route {route}"
                    )));
                }
                None => {
                    path.push(segment);
                }
            }
        }
    }

    let mut major = MajorParams::new();
    let mut query = Vec::new();
    for (name, value) in &params.0 {
        if config.is_major(name) {
            major.insert(name.as_str(), value.as_str());
        } else if !used.contains(name.as_str()) {
            query.push((name, value));
        }
    }
    if !query.is_empty() {
        url.query_pairs_mut().extend_pairs(query);
    }

    Ok(Resolved {
        url,
        key: route.key(method),
        major,
    })
}

fn placeholder(segment: &str) -> Option<&str> {
    segment
        .strip_prefix('{')?
        .strip_suffix('}')
        .filter(|name| !name.is_empty() && !name.contains(['{', '}']))
}
