//! HAProxy configuration rendering.
//!
//! Rendering is a pure function of the directory snapshot and the instance
//! addresses. Services, hostnames and backends are emitted in sorted order so
//! identical snapshots always produce byte-identical output.

use std::fmt::Write;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::PathBuf;

use crate::directory::DirectorySnapshot;
use crate::service::Service;

/// Inputs to rendering that do not come from the directory.
#[derive(Debug, Clone)]
pub struct RenderSettings {
    /// Address bound on IPv4.
    pub ipv4: Ipv4Addr,
    /// Address bound on IPv6.
    pub ipv6: Ipv6Addr,
    /// Directory certificate files are written to.
    pub certs_dir: PathBuf,
}

/// A certificate file to install.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertFile {
    /// Destination path.
    pub path: PathBuf,
    /// PEM contents.
    pub contents: String,
}

/// Everything one pass installs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedConfig {
    /// Full HAProxy configuration document.
    pub document: String,
    /// One file per certificate-bearing service.
    pub certs: Vec<CertFile>,
}

const PREAMBLE: &str = "\
global
\tmaxconn 4096
\tquiet

defaults
\tlog\tglobal
\tmode\thttp
\toption\thttp-server-close
\toption\tredispatch
\ttimeout\tconnect\t5000
\ttimeout\tclient\t50000
\ttimeout\tserver\t50000

\tstats enable
\tstats uri /proxy-stats
\tstats realm haproxy\\ statistics
";

/// Render the configuration document and certificate files.
pub fn render(snapshot: &DirectorySnapshot, settings: &RenderSettings) -> RenderedConfig {
    let certs: Vec<CertFile> = snapshot
        .values()
        .filter(|s| s.has_cert())
        .map(|s| CertFile {
            path: settings.certs_dir.join(s.cert_file_name()),
            contents: s.cert.clone(),
        })
        .collect();

    let mut doc = String::with_capacity(4096);
    doc.push_str(PREAMBLE);

    // Writing to a String cannot fail
    let _ = write_frontends(&mut doc, snapshot, settings, &certs);
    for service in snapshot.values() {
        let _ = write_backend(&mut doc, service);
    }

    RenderedConfig {
        document: doc,
        certs,
    }
}

fn write_frontends(
    doc: &mut String,
    snapshot: &DirectorySnapshot,
    settings: &RenderSettings,
    certs: &[CertFile],
) -> std::fmt::Result {
    writeln!(doc)?;
    writeln!(doc, "frontend public")?;
    writeln!(doc, "\tbind {}:80", settings.ipv4)?;
    writeln!(doc, "\tbind ipv6@{}:80", settings.ipv6)?;
    writeln!(doc, "\thttp-request set-header X-Forwarded-Proto http")?;
    for service in snapshot.values() {
        for hostname in &service.hostnames {
            writeln!(
                doc,
                "\tuse_backend {} if {{ hdr(host) -i {} }}",
                service.name, hostname
            )?;
        }
    }

    writeln!(doc)?;
    writeln!(doc, "frontend public_ssl")?;
    if certs.is_empty() {
        writeln!(doc, "\t# no certificates installed")?;
    } else {
        let crt: String = certs
            .iter()
            .map(|c| format!(" crt {}", c.path.display()))
            .collect();
        writeln!(doc, "\tbind {}:443 ssl{}", settings.ipv4, crt)?;
        writeln!(doc, "\tbind ipv6@{}:443 ssl{}", settings.ipv6, crt)?;
    }
    writeln!(doc, "\thttp-request set-header X-Forwarded-Proto https")?;
    for service in snapshot.values() {
        for hostname in &service.hostnames {
            writeln!(
                doc,
                "\tuse_backend {} if {{ ssl_fc_sni -i {} }}",
                service.name, hostname
            )?;
        }
    }

    Ok(())
}

fn write_backend(doc: &mut String, service: &Service) -> std::fmt::Result {
    writeln!(doc)?;
    writeln!(doc, "backend {}", service.name)?;
    writeln!(doc, "\tmode http")?;
    writeln!(doc, "\tbalance roundrobin")?;
    writeln!(doc, "\tcookie {} insert indirect nocache", service.name)?;
    writeln!(doc, "\toption forwardfor")?;
    for (i, endpoint) in service.backends.endpoints().into_iter().enumerate() {
        writeln!(doc, "\tserver srv{i} {endpoint} cookie srv{i}")?;
    }
    Ok(())
}
