use anyhow::{Context, Result};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Retrieves raw model artifacts. Sources are either HTTP(S) URLs or local
/// filesystem paths; transport is a plain byte fetch either way.
pub struct ModelFetcher {
    client: reqwest::blocking::Client,
}

impl ModelFetcher {
    pub fn new() -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .user_agent(concat!("mattebox/", env!("CARGO_PKG_VERSION")))
            .redirect(reqwest::redirect::Policy::limited(10))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { client })
    }

    /// True when the source needs network transport rather than a file read.
    pub fn is_remote(source: &str) -> bool {
        source.starts_with("http://") || source.starts_with("https://")
    }

    /// Fetch the bytes for one source. A non-2xx status is a source failure.
    pub fn fetch(&self, source: &str) -> Result<Vec<u8>> {
        if Self::is_remote(source) {
            let response = self
                .client
                .get(source)
                .send()
                .with_context(|| format!("Failed to fetch {source}"))?;
            if !response.status().is_success() {
                anyhow::bail!("fetch {} for {source}", response.status().as_u16());
            }
            let bytes = response
                .bytes()
                .with_context(|| format!("Failed to read body of {source}"))?;
            Ok(bytes.to_vec())
        } else {
            let path = Path::new(source);
            fs::read(path).with_context(|| format!("Failed to read model file {}", path.display()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_detection_checks_scheme() {
        assert!(ModelFetcher::is_remote("http://host/model.onnx"));
        assert!(ModelFetcher::is_remote("https://host/model.onnx"));
        assert!(!ModelFetcher::is_remote("/tmp/model.onnx"));
        assert!(!ModelFetcher::is_remote("model.onnx"));
    }

    #[test]
    fn local_paths_read_from_disk() {
        let path = std::env::temp_dir().join(format!("mattebox-fetch-{}.onnx", std::process::id()));
        fs::write(&path, b"not a real model").unwrap();

        let fetcher = ModelFetcher::new().unwrap();
        let bytes = fetcher.fetch(path.to_str().unwrap()).unwrap();
        assert_eq!(bytes, b"not a real model");

        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn missing_local_path_is_an_error() {
        let fetcher = ModelFetcher::new().unwrap();
        let err = fetcher.fetch("/definitely/not/here.onnx").unwrap_err();
        assert!(err.to_string().contains("not/here.onnx"));
    }
}
