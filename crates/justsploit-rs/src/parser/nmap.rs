use quick_xml::{de::from_str, events::Event, Reader};

use crate::{
    error::ScanError,
    models::{
        AddressRecord, HostRecord, HostnameRecord, NmapReport, OsGuess, PortRecord, ScanInfo,
        ServiceRecord,
    },
};

#[derive(Debug, serde::Deserialize)]
struct NmapRun {
    #[serde(rename = "scaninfo", default)]
    scan_info: Vec<NmapScanInfo>,
    #[serde(rename = "host", default)]
    hosts: Vec<NmapHost>,
}

#[derive(Debug, serde::Deserialize)]
struct NmapScanInfo {
    #[serde(rename = "@type")]
    scan_type: Option<String>,
    #[serde(rename = "@protocol")]
    protocol: Option<String>,
    #[serde(rename = "@numservices")]
    numservices: Option<String>,
}

#[derive(Debug, serde::Deserialize)]
struct NmapHost {
    #[serde(rename = "address", default)]
    addresses: Vec<NmapAddress>,
    #[serde(default)]
    hostnames: Option<NmapHostnames>,
    #[serde(default)]
    os: Option<NmapOs>,
    #[serde(default)]
    ports: Option<NmapPorts>,
}

#[derive(Debug, serde::Deserialize)]
struct NmapAddress {
    #[serde(rename = "@addr")]
    addr: String,
    #[serde(rename = "@addrtype")]
    addrtype: Option<String>,
}

#[derive(Debug, serde::Deserialize)]
struct NmapHostnames {
    #[serde(rename = "hostname", default)]
    hostnames: Vec<NmapHostname>,
}

#[derive(Debug, serde::Deserialize)]
struct NmapHostname {
    #[serde(rename = "@name")]
    name: String,
    #[serde(rename = "@type")]
    kind: Option<String>,
}

#[derive(Debug, serde::Deserialize)]
struct NmapOs {
    #[serde(rename = "osmatch", default)]
    matches: Vec<NmapOsMatch>,
}

#[derive(Debug, serde::Deserialize)]
struct NmapOsMatch {
    #[serde(rename = "@name")]
    name: String,
    #[serde(rename = "@accuracy")]
    accuracy: Option<String>,
    #[serde(rename = "@line")]
    line: Option<String>,
}

#[derive(Debug, serde::Deserialize)]
struct NmapPorts {
    #[serde(rename = "port", default)]
    ports: Vec<NmapPort>,
}

#[derive(Debug, serde::Deserialize)]
struct NmapPort {
    #[serde(rename = "@portid")]
    portid: u16,
    #[serde(rename = "@protocol")]
    protocol: String,
    #[serde(default)]
    state: Option<NmapState>,
    #[serde(default)]
    service: Option<NmapService>,
}

#[derive(Debug, serde::Deserialize)]
struct NmapState {
    #[serde(rename = "@state")]
    state: String,
}

#[derive(Debug, serde::Deserialize)]
struct NmapService {
    #[serde(rename = "@name")]
    name: Option<String>,
    #[serde(rename = "@product")]
    product: Option<String>,
    #[serde(rename = "@version")]
    version: Option<String>,
    #[serde(rename = "@extrainfo")]
    extrainfo: Option<String>,
}

pub fn parse_nmap_xml(xml: &str) -> Result<NmapReport, ScanError> {
    let run: NmapRun =
        from_str(xml).map_err(|e| ScanError::Parse(format!("Failed to parse XML: {e}")))?;
    check_single_root(xml).map_err(|e| ScanError::Parse(format!("Failed to parse XML: {e}")))?;

    let scan_info = run
        .scan_info
        .into_iter()
        .next()
        .map(|info| ScanInfo {
            scan_type: info.scan_type,
            protocol: info.protocol,
            service_count: info.numservices.and_then(|n| n.trim().parse().ok()),
        })
        .unwrap_or(ScanInfo {
            scan_type: None,
            protocol: None,
            service_count: None,
        });

    let hosts = run.hosts.into_iter().map(host_record).collect();
    Ok(NmapReport { scan_info, hosts })
}

// The deserializer stops at the end of the root element; nothing but
// whitespace, comments and processing instructions may follow it.
fn check_single_root(xml: &str) -> Result<(), String> {
    let mut reader = Reader::from_str(xml);
    let mut depth = 0usize;
    let mut root_closed = false;
    loop {
        let event = reader.read_event().map_err(|e| e.to_string())?;
        let trailing = match event {
            Event::Eof => return Ok(()),
            Event::Start(_) => {
                depth += 1;
                root_closed
            }
            Event::End(_) => {
                depth = depth.saturating_sub(1);
                root_closed |= depth == 0;
                false
            }
            Event::Empty(_) => {
                let junk = root_closed;
                root_closed |= depth == 0;
                junk
            }
            Event::Text(text) => root_closed && !text.iter().all(u8::is_ascii_whitespace),
            Event::CData(_) => root_closed,
            _ => false,
        };
        if trailing {
            return Err(format!(
                "junk after document element at position {}",
                reader.buffer_position()
            ));
        }
    }
}

fn host_record(host: NmapHost) -> HostRecord {
    let addresses = host
        .addresses
        .into_iter()
        .map(|a| AddressRecord {
            addr_type: a.addrtype,
            addr: a.addr,
        })
        .collect();

    let hostnames = host
        .hostnames
        .map(|h| h.hostnames)
        .unwrap_or_default()
        .into_iter()
        .map(|h| HostnameRecord {
            name: h.name,
            kind: h.kind,
        })
        .collect();

    let ports = host
        .ports
        .map(|p| p.ports)
        .unwrap_or_default()
        .into_iter()
        .map(|p| PortRecord {
            port: p.portid,
            protocol: p.protocol,
            state: p.state.map(|s| s.state),
            service: p.service.map(|s| ServiceRecord {
                name: s.name,
                product: s.product,
                version: s.version,
                extrainfo: s.extrainfo,
            }),
        })
        .collect();

    HostRecord {
        addresses,
        hostnames,
        os_info: host.os.and_then(|os| best_os_match(os.matches)),
        ports,
    }
}

// Highest accuracy wins; on a tie the earlier match (nmap's own ranking) stays.
fn best_os_match(matches: Vec<NmapOsMatch>) -> Option<OsGuess> {
    let mut best: Option<OsGuess> = None;
    for m in matches {
        let accuracy = m
            .accuracy
            .as_deref()
            .and_then(|a| a.trim().parse::<u8>().ok())
            .unwrap_or(0);
        if best.as_ref().map_or(true, |b| accuracy > b.accuracy) {
            best = Some(OsGuess {
                name: m.name,
                accuracy,
                line: m.line,
            });
        }
    }
    best
}
