use std::time::Duration;

use bon::Builder;
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderValue};
use reqwest::multipart::{Form, Part};
use reqwest::{Client as ReqwestClient, Method};
use serde::Serialize;
use url::Url;

use crate::Result;

/// A request ready to be executed through a bucket.
///
/// Kept in an owned, rebuildable form so a 429 can be retried with an identical
/// payload.
#[derive(Clone, Debug, Builder)]
pub struct Request {
    method: Method,
    url: Url,
    /// Headers added on top of the client's default headers.
    #[builder(default)]
    headers: HeaderMap,
    #[builder(default)]
    body: Body,
    /// Treat the bucket as exhausted for this long after the response, for endpoints
    /// whose real limit is tighter than their headers claim.
    rate_limit_override: Option<Duration>,
}

impl Request {
    #[must_use]
    pub fn method(&self) -> &Method {
        &self.method
    }

    #[must_use]
    pub fn url(&self) -> &Url {
        &self.url
    }

    #[must_use]
    pub fn body(&self) -> &Body {
        &self.body
    }

    #[must_use]
    pub fn rate_limit_override(&self) -> Option<Duration> {
        self.rate_limit_override
    }

    /// Builds a fresh [`reqwest::Request`] for one attempt.
    pub(crate) fn to_reqwest(&self, client: &ReqwestClient) -> Result<reqwest::Request> {
        let request = client
            .request(self.method.clone(), self.url.clone())
            .headers(self.headers.clone());

        let request = match &self.body {
            Body::Empty => request,
            Body::Json(value) => request.json(value),
            Body::Form(pairs) => request
                .header(
                    CONTENT_TYPE,
                    HeaderValue::from_static("application/x-www-form-urlencoded"),
                )
                .body(serde_html_form::to_string(pairs)?),
            Body::Multipart(multipart) => request.multipart(multipart.to_form()?),
        };

        Ok(request.build()?)
    }
}

/// Request payload.
#[non_exhaustive]
#[derive(Clone, Debug, Default)]
pub enum Body {
    #[default]
    Empty,
    Json(serde_json::Value),
    /// `application/x-www-form-urlencoded` pairs
    Form(Vec<(String, String)>),
    Multipart(Multipart),
}

impl Body {
    /// Serializes `value` into a JSON body.
    pub fn json<T: Serialize + ?Sized>(value: &T) -> Result<Self> {
        Ok(Body::Json(serde_json::to_value(value)?))
    }

    #[must_use]
    pub fn form<K: Into<String>, V: Into<String>, I: IntoIterator<Item = (K, V)>>(
        pairs: I,
    ) -> Self {
        Body::Form(
            pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

/// A `multipart/form-data` payload of text fields and files.
#[derive(Clone, Debug, Default)]
pub struct Multipart {
    fields: Vec<(String, String)>,
    files: Vec<FilePart>,
}

#[non_exhaustive]
#[derive(Clone, Debug)]
pub struct FilePart {
    pub field: String,
    pub file_name: String,
    pub content_type: Option<String>,
    pub bytes: Vec<u8>,
}

impl FilePart {
    pub fn new<F: Into<String>, N: Into<String>>(field: F, file_name: N, bytes: Vec<u8>) -> Self {
        Self {
            field: field.into(),
            file_name: file_name.into(),
            content_type: None,
            bytes,
        }
    }

    #[must_use]
    pub fn with_content_type<S: Into<String>>(mut self, content_type: S) -> Self {
        self.content_type = Some(content_type.into());
        self
    }
}

impl Multipart {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn text<K: Into<String>, V: Into<String>>(mut self, name: K, value: V) -> Self {
        self.fields.push((name.into(), value.into()));
        self
    }

    #[must_use]
    pub fn file(mut self, file: FilePart) -> Self {
        self.files.push(file);
        self
    }

    #[must_use]
    pub fn files(&self) -> &[FilePart] {
        &self.files
    }

    /// `reqwest` forms are consumed on send, so every attempt gets a new one.
    fn to_form(&self) -> Result<Form> {
        let mut form = Form::new();
        for (name, value) in &self.fields {
            form = form.text(name.clone(), value.clone());
        }
        for file in &self.files {
            let mut part = Part::bytes(file.bytes.clone()).file_name(file.file_name.clone());
            if let Some(content_type) = &file.content_type {
                part = part.mime_str(content_type)?;
            }
            form = form.part(file.field.clone(), part);
        }
        Ok(form)
    }
}
