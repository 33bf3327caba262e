use crate::connection::{Body, ConnectionError, Dialer, RequestParams};
use crate::runner::STATUS_OK;
use std::collections::BTreeMap;
use std::io::Write;

/// The response to a single request. The body has been received but not
/// yet checked, so the head stays available when the body is truncated.
#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub proto_major: u8,
    pub proto_minor: u8,
    pub status: u16,
    pub headers: BTreeMap<String, Vec<String>>,
    pub body: Body,
}

impl FetchedResponse {
    /// Status 0 means the responder sent no status at all and counts as
    /// success, same as 200.
    pub fn is_success(&self) -> bool {
        is_success_status(self.status)
    }

    /// Write the status line, one line per header value and a blank line.
    pub fn write_head(&self, out: &mut impl Write) -> std::io::Result<()> {
        writeln!(
            out,
            "HTTP/{}.{} {}",
            self.proto_major, self.proto_minor, self.status
        )?;
        for (name, values) in &self.headers {
            for value in values {
                writeln!(out, "{}: {}", name, value)?;
            }
        }
        writeln!(out)
    }

    /// Write the head to `head_out` when `verbose`, then the body to
    /// `body_out`. The head goes out before the body is read. Returns
    /// whether the status counts as success.
    pub fn write_response(
        self,
        verbose: bool,
        head_out: &mut impl Write,
        body_out: &mut impl Write,
    ) -> anyhow::Result<bool> {
        if verbose {
            self.write_head(head_out)?;
            head_out.flush()?;
        }
        let success = self.is_success();
        let body = self.body.read_all()?;
        body_out.write_all(&body)?;
        body_out.flush()?;
        Ok(success)
    }
}

pub fn is_success_status(status: u16) -> bool {
    status == 0 || status == STATUS_OK
}

/// Dial and issue exactly one request. The connection is closed before
/// returning, whatever the result.
pub async fn fetch_once(
    dialer: &dyn Dialer,
    params: &RequestParams,
) -> Result<FetchedResponse, ConnectionError> {
    let mut conn = dialer.dial().await?;
    let result = conn.get(params).await.map(|response| FetchedResponse {
        proto_major: response.proto_major,
        proto_minor: response.proto_minor,
        status: response.status,
        headers: response.headers,
        body: response.body,
    });
    conn.close().await;
    result
}
