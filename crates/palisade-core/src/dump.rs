//! Canonical HTTP dump.
//!
//! A protocol-independent snapshot of an HTTP request or response and its
//! canonical textual serialization: request line (or status line), `Host:`
//! line, headers sorted by name with one line per value, a blank line, then
//! the body. Lines are LF-terminated. The canonical form is the substrate
//! both for rule matching and for the base64 payload shipped to the
//! collector.

/// Snapshot of an HTTP request as received on the listening side.
///
/// `headers` holds one entry per header value (repeated headers repeat the
/// name) and never contains `Host`, which is kept separately.
#[derive(Debug, Clone, Default)]
pub struct RequestDump {
    pub method: String,
    pub path: String,
    pub query: Option<String>,
    /// Protocol version as printed on the request line, e.g. `HTTP/1.1`.
    pub version: String,
    pub host: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl RequestDump {
    /// Serialize into the canonical dumped form.
    pub fn canonical(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(256 + self.body.len());
        out.extend_from_slice(self.method.as_bytes());
        out.push(b' ');
        out.extend_from_slice(self.path.as_bytes());
        if let Some(ref query) = self.query {
            out.push(b'?');
            out.extend_from_slice(query.as_bytes());
        }
        out.push(b' ');
        out.extend_from_slice(self.version.as_bytes());
        out.push(b'\n');
        out.extend_from_slice(b"Host: ");
        out.extend_from_slice(self.host.as_bytes());
        out.push(b'\n');
        write_headers(&mut out, &self.headers);
        out.push(b'\n');
        out.extend_from_slice(&self.body);
        out
    }

    /// The canonical form as text, with invalid UTF-8 replaced.
    pub fn canonical_text(&self) -> String {
        String::from_utf8_lossy(&self.canonical()).into_owned()
    }

    /// Number of LF-terminated lines before the body in the canonical form:
    /// request line, `Host:` line, one line per header value, blank line.
    pub fn body_line_offset(&self) -> usize {
        3 + self.headers.len()
    }
}

/// Snapshot of an HTTP response as returned by the upstream.
#[derive(Debug, Clone, Default)]
pub struct ResponseDump {
    /// Protocol version as printed on the status line, e.g. `HTTP/1.1`.
    pub version: String,
    pub status: u16,
    pub reason: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl ResponseDump {
    /// Serialize into the canonical dumped form (status line first).
    pub fn canonical(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(256 + self.body.len());
        out.extend_from_slice(self.version.as_bytes());
        out.push(b' ');
        out.extend_from_slice(self.status.to_string().as_bytes());
        out.push(b' ');
        out.extend_from_slice(self.reason.as_bytes());
        out.push(b'\n');
        write_headers(&mut out, &self.headers);
        out.push(b'\n');
        out.extend_from_slice(&self.body);
        out
    }

    /// The canonical form as text, with invalid UTF-8 replaced.
    pub fn canonical_text(&self) -> String {
        String::from_utf8_lossy(&self.canonical()).into_owned()
    }

    /// Number of LF-terminated lines before the body in the canonical form.
    pub fn body_line_offset(&self) -> usize {
        2 + self.headers.len()
    }
}

/// Sort headers by name (case-insensitive, stable) and emit one
/// `Name: value` line per value. Repeated headers stay repeated; the
/// lossy `;` joining of older agents is deliberately not reproduced.
fn write_headers(out: &mut Vec<u8>, headers: &[(String, String)]) {
    let mut sorted: Vec<&(String, String)> = headers.iter().collect();
    sorted.sort_by(|a, b| a.0.to_ascii_lowercase().cmp(&b.0.to_ascii_lowercase()));
    for (name, value) in sorted {
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.push(b'\n');
    }
}
