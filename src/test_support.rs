//! In-memory fakes for the network seams.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use crate::fetch::{Asset, Fetcher};
use crate::gemini::{
    Candidate, Content, GenerateRequest, GenerateResponse, GenerativeModel, InlineData, Part,
};

#[derive(Default)]
pub struct FakeFetcher {
    pages: HashMap<String, String>,
    assets: HashMap<String, Asset>,
}

impl FakeFetcher {
    pub fn page(mut self, url: &str, html: &str) -> Self {
        self.pages.insert(url.to_string(), html.to_string());
        self
    }

    pub fn asset(mut self, url: &str, data: &[u8], content_type: Option<&str>) -> Self {
        self.assets.insert(
            url.to_string(),
            Asset {
                data: data.to_vec(),
                content_type: content_type.map(|s| s.to_string()),
            },
        );
        self
    }
}

#[async_trait]
impl Fetcher for FakeFetcher {
    async fn text(&self, url: &str) -> Result<String> {
        self.pages
            .get(url)
            .cloned()
            .ok_or_else(|| anyhow!("HTTP status client error (404 Not Found) for url ({})", url))
    }

    async fn asset(&self, url: &str) -> Result<Asset> {
        self.assets
            .get(url)
            .cloned()
            .ok_or_else(|| anyhow!("HTTP status client error (404 Not Found) for url ({})", url))
    }
}

type Handler = dyn Fn(usize, &str, &GenerateRequest) -> Result<GenerateResponse> + Send + Sync;

/// Model fake driven by a closure receiving (call index, model, request).
pub struct FakeModel {
    handler: Box<Handler>,
    calls: AtomicUsize,
    pub requests: Mutex<Vec<(String, GenerateRequest)>>,
}

impl FakeModel {
    pub fn new(
        handler: impl Fn(usize, &str, &GenerateRequest) -> Result<GenerateResponse> + Send + Sync + 'static,
    ) -> Self {
        Self {
            handler: Box::new(handler),
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GenerativeModel for FakeModel {
    async fn generate(&self, model: &str, request: &GenerateRequest) -> Result<GenerateResponse> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests
            .lock()
            .unwrap()
            .push((model.to_string(), request.clone()));
        (self.handler)(n, model, request)
    }
}

pub fn text_response(text: &str) -> GenerateResponse {
    response(vec![Part {
        text: Some(text.to_string()),
        inline_data: None,
    }])
}

pub fn image_response(mime_type: &str, data_b64: &str) -> GenerateResponse {
    response(vec![
        Part {
            text: Some("Here is the diorama.".into()),
            inline_data: None,
        },
        Part {
            text: None,
            inline_data: Some(InlineData {
                mime_type: mime_type.to_string(),
                data: data_b64.to_string(),
            }),
        },
    ])
}

fn response(parts: Vec<Part>) -> GenerateResponse {
    GenerateResponse {
        candidates: vec![Candidate {
            content: Some(Content {
                role: Some("model".into()),
                parts,
            }),
        }],
    }
}
