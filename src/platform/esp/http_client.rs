use std::time::Duration;

use embedded_svc::http::client::Connection;
use embedded_svc::http::Method;
use esp_idf_svc::http::client::{Configuration as HttpConfig, EspHttpConnection};
use esp_idf_svc::io::Read;

use crate::ota::source::{ByteSource, Chunk, HttpClient};
use crate::ota::{OtaError, Result};

/// Blocking HTTP(S) GET over esp_http_client, certificates from the IDF bundle.
pub struct EspHttpClient {
    buffer_size: usize,
    timeout: Duration,
}

impl Default for EspHttpClient {
    fn default() -> Self {
        Self {
            buffer_size: 4096,
            timeout: Duration::from_secs(60),
        }
    }
}

impl EspHttpClient {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            ..Self::default()
        }
    }

    fn config(&self) -> HttpConfig {
        HttpConfig {
            buffer_size: Some(self.buffer_size),
            timeout: Some(self.timeout),
            crt_bundle_attach: Some(esp_idf_sys::esp_crt_bundle_attach),
            ..Default::default()
        }
    }
}

struct ResponseSource {
    conn: EspHttpConnection,
}

impl ByteSource for ResponseSource {
    fn next_chunk(&mut self, buf: &mut [u8]) -> Result<Chunk> {
        match self.conn.read(buf) {
            Ok(0) => Ok(Chunk::End),
            Ok(n) => Ok(Chunk::Data(n)),
            Err(e) => {
                log::error!("HTTP read failed: {:?}", e);
                Err(OtaError::TransferInterrupted)
            }
        }
    }
}

impl HttpClient for EspHttpClient {
    fn get<'a>(&'a self, url: &str) -> Result<Box<dyn ByteSource + 'a>> {
        let network = |e: esp_idf_sys::EspError| OtaError::Network(format!("{}: {}", url, e));

        let mut conn = EspHttpConnection::new(&self.config()).map_err(network)?;
        conn.initiate_request(Method::Get, url, &[])
            .map_err(|e| OtaError::Network(format!("{}: {:?}", url, e)))?;
        conn.initiate_response()
            .map_err(|e| OtaError::Network(format!("{}: {:?}", url, e)))?;

        let status = conn.status();
        if status != 200 {
            return Err(OtaError::Network(format!("{}: HTTP {}", url, status)));
        }
        Ok(Box::new(ResponseSource { conn }))
    }
}
