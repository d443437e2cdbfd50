//! Upload gateway: ships one document to the remote document-management API.
//!
//! One multipart POST with bearer authorization. Failures come back as
//! [`UploadError`] and are never retried here; the caller decides whether to
//! re-queue.

use std::time::Duration;

use reqwest::blocking::{multipart, Client};

use crate::error::UploadError;
use crate::types::{UploadReceipt, UploadRequest};

/// Longest server message kept in a rejection error.
const MAX_MESSAGE_CHARS: usize = 512;

pub trait UploadGateway: Send + Sync {
    fn upload(&self, request: &UploadRequest) -> Result<UploadReceipt, UploadError>;
}

/// [`UploadGateway`] speaking HTTP to the configured endpoint.
#[derive(Debug, Clone)]
pub struct HttpUploadGateway {
    client: Client,
    endpoint: Option<String>,
}

impl HttpUploadGateway {
    pub fn new(endpoint: Option<String>, timeout: Duration) -> Result<Self, UploadError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client, endpoint })
    }

    fn build_form(&self, request: &UploadRequest, bytes: Vec<u8>) -> Result<multipart::Form, UploadError> {
        let file_name = request
            .file_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "document.pdf".to_string());
        let mime = if file_name.to_lowercase().ends_with(".pdf") {
            "application/pdf"
        } else {
            "application/octet-stream"
        };
        let part = multipart::Part::bytes(bytes)
            .file_name(file_name)
            .mime_str(mime)?;

        let destination = &request.destination;
        let mut form = multipart::Form::new()
            .part("file", part)
            .text("cabinet_id", destination.cabinet_id.clone())
            .text("category_id", destination.category_id.clone());
        if let Some(subcategory) = destination.subcategory_id.clone() {
            form = form.text("subcategory_id", subcategory);
        }
        Ok(form
            .text("title", request.effective_title())
            .text("description", destination.description.clone().unwrap_or_default()))
    }
}

impl UploadGateway for HttpUploadGateway {
    fn upload(&self, request: &UploadRequest) -> Result<UploadReceipt, UploadError> {
        if request.auth_token.trim().is_empty() {
            return Err(UploadError::NoSession);
        }
        let endpoint = self
            .endpoint
            .as_deref()
            .ok_or_else(|| UploadError::InvalidRequest("no upload endpoint configured".into()))?;

        // Fail fast on a vanished file before touching the network.
        let bytes = match fs_err::read(&request.file_path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(UploadError::MissingFile(request.file_path.clone()))
            }
            Err(err) => return Err(UploadError::InvalidRequest(err.to_string())),
        };

        let form = self.build_form(request, bytes)?;
        tracing::info!(
            file = %request.file_path.display(),
            cabinet_id = %request.destination.cabinet_id,
            category_id = %request.destination.category_id,
            "Uploading document"
        );

        let response = self
            .client
            .post(endpoint)
            .bearer_auth(request.auth_token.trim())
            .multipart(form)
            .send()?;

        let status = response.status();
        let body = response.text().unwrap_or_default();
        if status.is_success() {
            Ok(UploadReceipt {
                status: status.as_u16(),
                body,
            })
        } else {
            Err(UploadError::ServerRejected {
                status: status.as_u16(),
                message: body.trim().chars().take(MAX_MESSAGE_CHARS).collect(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Destination;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::path::{Path, PathBuf};
    use std::thread::{self, JoinHandle};

    fn request(path: &Path, token: &str) -> UploadRequest {
        UploadRequest {
            file_path: path.to_path_buf(),
            destination: Destination {
                cabinet_id: "12".into(),
                category_id: "7".into(),
                subcategory_id: Some("3".into()),
                title: None,
                description: Some("printed".into()),
            },
            auth_token: token.into(),
        }
    }

    /// Accepts one connection, captures the raw request, answers with `status`.
    fn one_shot_server(status: &'static str, body: &'static str) -> (String, JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}/api/documents", listener.local_addr().unwrap());
        let handle = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            stream
                .set_read_timeout(Some(Duration::from_secs(5)))
                .unwrap();
            let mut buffer = Vec::new();
            let mut chunk = [0u8; 8192];
            loop {
                let n = stream.read(&mut chunk).unwrap_or(0);
                if n == 0 {
                    break;
                }
                buffer.extend_from_slice(&chunk[..n]);
                if request_complete(&buffer) {
                    break;
                }
            }
            let response = format!(
                "HTTP/1.1 {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                status,
                body.len(),
                body
            );
            stream.write_all(response.as_bytes()).unwrap();
            stream.flush().unwrap();
            String::from_utf8_lossy(&buffer).into_owned()
        });
        (url, handle)
    }

    fn request_complete(buffer: &[u8]) -> bool {
        let text = String::from_utf8_lossy(buffer);
        let Some(header_end) = text.find("\r\n\r\n") else {
            return false;
        };
        let headers = text[..header_end].to_lowercase();
        let body_len = buffer.len() - (header_end + 4);
        match headers
            .lines()
            .find_map(|line| line.strip_prefix("content-length:"))
            .and_then(|value| value.trim().parse::<usize>().ok())
        {
            Some(expected) => body_len >= expected,
            None => text.ends_with("--\r\n"),
        }
    }

    fn pdf(dir: &Path) -> PathBuf {
        let path = dir.join("invoice.pdf");
        fs_err::write(&path, b"%PDF-1.7 test").unwrap();
        path
    }

    #[test]
    fn test_missing_token_is_no_session() {
        let gateway = HttpUploadGateway::new(Some("http://127.0.0.1:9".into()), Duration::from_secs(1)).unwrap();
        let err = gateway.upload(&request(Path::new("/nope.pdf"), " ")).unwrap_err();
        assert!(matches!(err, UploadError::NoSession));
    }

    #[test]
    fn test_missing_file_fails_without_network() {
        // Port 9 (discard) is never contacted: the file check comes first.
        let gateway = HttpUploadGateway::new(Some("http://127.0.0.1:9".into()), Duration::from_secs(1)).unwrap();
        let temp = tempfile::tempdir().unwrap();
        let missing = temp.path().join("gone.pdf");
        let err = gateway.upload(&request(&missing, "tok")).unwrap_err();
        assert!(matches!(err, UploadError::MissingFile(path) if path == missing));
    }

    #[test]
    fn test_successful_upload_sends_multipart_with_bearer() {
        let temp = tempfile::tempdir().unwrap();
        let path = pdf(temp.path());
        let (url, server) = one_shot_server("201 Created", "{\"id\":1}");

        let gateway = HttpUploadGateway::new(Some(url), Duration::from_secs(5)).unwrap();
        let receipt = gateway.upload(&request(&path, "tok-1")).unwrap();
        assert_eq!(receipt.status, 201);
        assert_eq!(receipt.body, "{\"id\":1}");

        let raw = server.join().unwrap();
        assert!(raw.starts_with("POST /api/documents"));
        assert!(raw.to_lowercase().contains("authorization: bearer tok-1"));
        assert!(raw.contains("name=\"cabinet_id\""));
        assert!(raw.contains("name=\"subcategory_id\""));
        assert!(raw.contains("filename=\"invoice.pdf\""));
        assert!(raw.contains("%PDF-1.7 test"));
    }

    #[test]
    fn test_server_rejection_carries_status_and_message() {
        let temp = tempfile::tempdir().unwrap();
        let path = pdf(temp.path());
        let (url, server) = one_shot_server("422 Unprocessable Entity", "bad category");

        let gateway = HttpUploadGateway::new(Some(url), Duration::from_secs(5)).unwrap();
        let err = gateway.upload(&request(&path, "tok")).unwrap_err();
        server.join().unwrap();
        match err {
            UploadError::ServerRejected { status, message } => {
                assert_eq!(status, 422);
                assert_eq!(message, "bad category");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_unreachable_server_is_network_error() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}/", listener.local_addr().unwrap());
        drop(listener);

        let temp = tempfile::tempdir().unwrap();
        let path = pdf(temp.path());
        let gateway = HttpUploadGateway::new(Some(url), Duration::from_secs(2)).unwrap();
        assert!(matches!(
            gateway.upload(&request(&path, "tok")).unwrap_err(),
            UploadError::Network(_)
        ));
    }
}
