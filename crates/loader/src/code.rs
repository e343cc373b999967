//! Capability code retrieval.
//!
//! `codeUrl` is either an `https:` URL or an inline `data:` URL
//! (percent-encoded or base64). Every failure here is
//! `module-import-failed` — the code never arrived, nothing ran.

use base64::Engine as _;

use caprun_domain::error::{Error, ErrorKind, Result};

pub(crate) async fn fetch_code(http: &reqwest::Client, code_url: &str) -> Result<String> {
    if let Some(rest) = code_url.strip_prefix("data:") {
        return decode_data_url(rest, code_url);
    }

    let response = http.get(code_url).send().await.map_err(|error| {
        Error::new(
            ErrorKind::ModuleImportFailed,
            format!("code fetch failed: {error}"),
        )
        .with("codeUrl", code_url)
    })?;

    let status = response.status();
    if !status.is_success() {
        return Err(Error::new(
            ErrorKind::ModuleImportFailed,
            format!("code fetch answered HTTP {status}"),
        )
        .with("codeUrl", code_url));
    }

    response.text().await.map_err(|error| {
        Error::new(
            ErrorKind::ModuleImportFailed,
            format!("code fetch interrupted: {error}"),
        )
        .with("codeUrl", code_url)
    })
}

fn decode_data_url(rest: &str, code_url: &str) -> Result<String> {
    let (media, payload) = rest.split_once(',').ok_or_else(|| {
        Error::new(ErrorKind::ModuleImportFailed, "malformed data: URL (no comma)")
            .with("codeUrl", code_url)
    })?;

    if media.ends_with(";base64") {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(payload)
            .map_err(|error| {
                Error::new(
                    ErrorKind::ModuleImportFailed,
                    format!("malformed base64 data: URL: {error}"),
                )
                .with("codeUrl", code_url)
            })?;
        return String::from_utf8(bytes).map_err(|_| {
            Error::new(ErrorKind::ModuleImportFailed, "data: URL is not UTF-8 text")
                .with("codeUrl", code_url)
        });
    }

    urlencoding::decode(payload)
        .map(|decoded| decoded.into_owned())
        .map_err(|_| {
            Error::new(ErrorKind::ModuleImportFailed, "data: URL is not UTF-8 text")
                .with("codeUrl", code_url)
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn plain_data_url() {
        let http = reqwest::Client::new();
        let code = fetch_code(
            &http,
            "data:application/javascript,export function run(){return 'ok'}",
        )
        .await
        .unwrap();
        assert_eq!(code, "export function run(){return 'ok'}");
    }

    #[tokio::test]
    async fn percent_encoded_data_url() {
        let http = reqwest::Client::new();
        let code = fetch_code(&http, "data:application/javascript,a%20%2B%20b").await.unwrap();
        assert_eq!(code, "a + b");
    }

    #[tokio::test]
    async fn base64_data_url() {
        let http = reqwest::Client::new();
        let encoded = base64::engine::general_purpose::STANDARD.encode("export const x = 1;");
        let code = fetch_code(&http, &format!("data:application/javascript;base64,{encoded}"))
            .await
            .unwrap();
        assert_eq!(code, "export const x = 1;");
    }

    #[tokio::test]
    async fn malformed_data_url_fails() {
        let http = reqwest::Client::new();
        let err = fetch_code(&http, "data:application/javascript").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::ModuleImportFailed);
    }
}
