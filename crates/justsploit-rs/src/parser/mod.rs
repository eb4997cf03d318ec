pub mod nmap;
pub mod whatweb;

use crate::{
    error::ScanError,
    models::{ScanPayload, ToolKind},
};

pub use nmap::parse_nmap_xml;
pub use whatweb::parse_whatweb_output;

/// Turn raw tool output into a payload. Never fails: unparseable input comes
/// back as `ScanPayload::Error` (nmap) or a `raw` fallback (whatweb).
pub fn normalize(tool: ToolKind, raw: &str) -> ScanPayload {
    match tool {
        ToolKind::PortScan => match parse_nmap_xml(raw) {
            Ok(report) => ScanPayload::PortScan(report),
            Err(ScanError::Parse(error)) => ScanPayload::Error { error },
            Err(e) => ScanPayload::Error {
                error: e.to_string(),
            },
        },
        ToolKind::Fingerprint => ScanPayload::Fingerprint(parse_whatweb_output(raw)),
    }
}
