use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use base64::Engine;
use regex::Regex;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{Error, Result};

const LENIENT: GeneralPurposeConfig =
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent);
const STANDARD: GeneralPurpose = GeneralPurpose::new(&alphabet::STANDARD, LENIENT);
const URL_SAFE: GeneralPurpose = GeneralPurpose::new(&alphabet::URL_SAFE, LENIENT);

/// Where the files of one host end up.
#[derive(Debug, Clone)]
pub struct OutputPaths {
    pub base64: PathBuf,
    pub clash: PathBuf,
    pub providers_dir: PathBuf,
}

impl OutputPaths {
    pub fn for_host(out_dir: &Path, host: &str) -> Self {
        Self {
            base64: out_dir.join("trials").join(host),
            clash: out_dir.join("trials").join(format!("{host}.yaml")),
            providers_dir: out_dir.join("trials_providers").join(host),
        }
    }
}

pub fn decode_base64(text: &str) -> Result<String> {
    let compact: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    let bytes = STANDARD
        .decode(&compact)
        .or_else(|_| URL_SAFE.decode(&compact))
        .map_err(|e| Error::Subscription(format!("invalid base64: {e}")))?;
    String::from_utf8(bytes).map_err(|e| Error::Subscription(format!("invalid utf-8: {e}")))
}

/// Display name of a node URI: vmess carries it as `ps` inside its payload,
/// everything else after `#`.
pub fn node_name(uri: &str) -> String {
    if let Some(payload) = uri.strip_prefix("vmess://") {
        if let Ok(json) = decode_base64(payload).and_then(|s| {
            serde_json::from_str::<Value>(&s).map_err(Error::from)
        }) {
            if let Some(ps) = json["ps"].as_str() {
                return ps.to_string();
            }
        }
        return String::new();
    }
    match uri.split_once('#') {
        Some((_, name)) => urlencoding::decode(name)
            .map(|n| n.into_owned())
            .unwrap_or_else(|_| name.to_string()),
        None => String::new(),
    }
}

/// Node URIs of a base64 subscription body, minus the excluded ones.
pub fn filter_nodes(base64: &str, exclude: Option<&str>) -> Result<Vec<String>> {
    let exclude = exclude
        .filter(|pattern| !pattern.is_empty())
        .map(Regex::new)
        .transpose()
        .map_err(|e| Error::Config(format!("invalid exclude pattern: {e}")))?;

    let text = decode_base64(base64)?;
    Ok(text
        .lines()
        .map(str::trim)
        .filter(|line| line.contains("://"))
        .filter(|line| {
            exclude
                .as_ref()
                .map_or(true, |re| !re.is_match(&node_name(line)))
        })
        .map(str::to_string)
        .collect())
}

/// Writes the base64 file, the clash file and the provider list.
/// Returns the number of nodes kept.
pub async fn gen_base64_and_clash_config(
    paths: &OutputPaths,
    base64: &str,
    clash: &str,
    exclude: Option<&str>,
) -> Result<usize> {
    let nodes = filter_nodes(base64, exclude)?;
    if nodes.is_empty() {
        return Err(Error::Subscription("subscription has no nodes".to_string()));
    }

    for path in [&paths.base64, &paths.clash] {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }
    tokio::fs::create_dir_all(&paths.providers_dir).await?;

    let joined = nodes.join("\n");
    tokio::fs::write(&paths.base64, STANDARD.encode(&joined)).await?;
    tokio::fs::write(&paths.clash, clash).await?;
    tokio::fs::write(paths.providers_dir.join("nodes.txt"), &joined).await?;
    debug!("wrote {} nodes to {}", nodes.len(), paths.base64.display());

    Ok(nodes.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(lines: &[&str]) -> String {
        STANDARD.encode(lines.join("\n"))
    }

    #[test]
    fn names_from_fragment_and_vmess() {
        assert_eq!(node_name("trojan://pw@h:443#HK%2001"), "HK 01");
        let vmess = format!("vmess://{}", STANDARD.encode(r#"{"ps":"JP 02","add":"h"}"#));
        assert_eq!(node_name(&vmess), "JP 02");
        assert_eq!(node_name("ss://abc"), "");
    }

    #[test]
    fn unpadded_and_url_safe_bodies_decode() {
        let body = STANDARD.encode("ss://a#x");
        assert_eq!(decode_base64(body.trim_end_matches('=')).unwrap(), "ss://a#x");
        let url_safe = URL_SAFE.encode("ss://a?b=>>>#y");
        assert_eq!(decode_base64(&url_safe).unwrap(), "ss://a?b=>>>#y");
        assert!(decode_base64("***").is_err());
    }

    #[test]
    fn exclude_drops_matching_nodes() {
        let body = encode(&["ss://a#HK 1", "ss://b#JP 1", "STATUS=ok", "ss://c#HK 2"]);
        assert_eq!(filter_nodes(&body, None).unwrap().len(), 3);
        assert_eq!(filter_nodes(&body, Some("HK")).unwrap(), vec!["ss://b#JP 1"]);
        assert!(filter_nodes(&body, Some("(")).is_err());
    }

    #[tokio::test]
    async fn writes_all_three_outputs() {
        let dir = tempfile::tempdir().unwrap();
        let paths = OutputPaths::for_host(dir.path(), "a.example");
        let body = encode(&["ss://a#HK", "ss://b#JP"]);

        let n = gen_base64_and_clash_config(&paths, &body, "proxies: []\n", Some("HK"))
            .await
            .unwrap();
        assert_eq!(n, 1);

        let saved = std::fs::read_to_string(&paths.base64).unwrap();
        assert_eq!(decode_base64(&saved).unwrap(), "ss://b#JP");
        assert_eq!(std::fs::read_to_string(&paths.clash).unwrap(), "proxies: []\n");
        assert_eq!(
            std::fs::read_to_string(paths.providers_dir.join("nodes.txt")).unwrap(),
            "ss://b#JP"
        );
    }

    #[tokio::test]
    async fn empty_node_list_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let paths = OutputPaths::for_host(dir.path(), "a.example");
        let body = encode(&["ss://a#HK"]);
        assert!(gen_base64_and_clash_config(&paths, &body, "", Some("HK"))
            .await
            .is_err());
        assert!(!paths.base64.exists());
    }
}
