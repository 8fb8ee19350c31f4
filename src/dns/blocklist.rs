//! Blocklist ingestion from hosts-file sources.
//!
//! A source is an HTTP(S) URL or a filesystem path. The payload must be
//! classic hosts-file format; a single malformed entry rejects the whole
//! payload so a half-broken list never half-loads.

use std::time::Duration;

use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Total time allowed for fetching one remote source.
const FETCH_TIMEOUT: Duration = Duration::from_secs(15);

/// Validates hosts-file content and extracts the host column.
///
/// Lines are `ip host [host ...]`; blank lines and `#` comments are
/// skipped; the second whitespace-separated field of each entry joins the
/// result.
pub fn parse_hosts_format(content: &str) -> Result<Vec<String>> {
    let mut hosts = Vec::new();

    for line in content.lines() {
        let line = line.trim();

        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let mut fields = line.split_whitespace();
        let _ip = fields.next();
        let Some(host) = fields.next() else {
            return Err(Error::InvalidBlocklist);
        };
        hosts.push(host.to_string());
    }

    Ok(hosts)
}

/// Reads one source, URL or path, and validates it.
pub async fn fetch_source(client: &reqwest::Client, source: &str) -> Result<Vec<String>> {
    let content = if source.starts_with("http") {
        client.get(source).send().await?.text().await?
    } else {
        debug!("loading blocklist from file: {}", source);
        tokio::fs::read_to_string(source).await?
    };

    parse_hosts_format(&content)
}

/// Fetches every source concurrently and aggregates the hosts. A failing
/// source is logged and skipped; the rest still load.
pub async fn load_sources(sources: &[String]) -> Vec<String> {
    debug!("loading blocklists from {:?}", sources);

    let client = match reqwest::Client::builder().timeout(FETCH_TIMEOUT).build() {
        Ok(client) => client,
        Err(build_error) => {
            warn!("unable to build blocklist HTTP client: {}", build_error);
            return Vec::new();
        }
    };

    let mut fetches = tokio::task::JoinSet::new();
    for source in sources {
        let client = client.clone();
        let source = source.clone();
        fetches.spawn(async move {
            let outcome = fetch_source(&client, &source).await;
            (source, outcome)
        });
    }

    let mut blocked = Vec::new();
    while let Some(joined) = fetches.join_next().await {
        match joined {
            Ok((_, Ok(hosts))) => blocked.extend(hosts),
            Ok((source, Err(fetch_error))) => {
                warn!("unable to load blocklist {}: {}", source, fetch_error);
            }
            Err(join_error) => warn!("blocklist fetch task failed: {}", join_error),
        }
    }

    info!("loaded {} blocked domains", blocked.len());
    blocked
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_hosts_format() {
        let content = "\
# ad servers
0.0.0.0 ads.example.com

0.0.0.0 tracker.example.com extra.example.com
127.0.0.1 telemetry.example.net
";
        let hosts = parse_hosts_format(content).unwrap();
        assert_eq!(
            hosts,
            vec![
                "ads.example.com",
                "tracker.example.com",
                "telemetry.example.net"
            ]
        );
    }

    #[test]
    fn test_invalid_line_rejects_whole_payload() {
        let content = "0.0.0.0 ads.example.com\njust-one-field\n";
        assert!(matches!(
            parse_hosts_format(content),
            Err(Error::InvalidBlocklist)
        ));
    }

    #[test]
    fn test_empty_and_comment_only_payloads() {
        assert!(parse_hosts_format("").unwrap().is_empty());
        assert!(parse_hosts_format("# nothing here\n\n").unwrap().is_empty());
    }

    #[test]
    fn test_duplicate_entries_are_kept() {
        let content = "0.0.0.0 ads.example.com\n0.0.0.0 ads.example.com\n";
        let hosts = parse_hosts_format(content).unwrap();
        assert_eq!(hosts.len(), 2);
    }

    #[tokio::test]
    async fn test_fetch_source_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hosts");
        std::fs::write(&path, "0.0.0.0 ads.example.com\n").unwrap();

        let client = reqwest::Client::new();
        let hosts = fetch_source(&client, path.to_str().unwrap()).await.unwrap();
        assert_eq!(hosts, vec!["ads.example.com"]);
    }

    #[tokio::test]
    async fn test_load_sources_skips_broken_source() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("good");
        let bad = dir.path().join("bad");
        std::fs::write(&good, "0.0.0.0 ads.example.com\n").unwrap();
        std::fs::write(&bad, "malformed\n").unwrap();

        let sources = vec![
            good.to_str().unwrap().to_string(),
            bad.to_str().unwrap().to_string(),
            dir.path().join("missing").to_str().unwrap().to_string(),
        ];
        let hosts = load_sources(&sources).await;
        assert_eq!(hosts, vec!["ads.example.com"]);
    }
}
