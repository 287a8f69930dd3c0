//! Proxy rule compilation: declarative rules become an ordered chain of
//! immutable forwarders, built once per server start from a snapshot of the
//! configured rules and never mutated afterwards.

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::header::{HeaderMap, HeaderName, HeaderValue};
use hyper::{Method, Response};
use std::time::Duration;
use tracing::debug;

use crate::config::ProxyRule;

/// Hop-by-hop headers that must not be forwarded upstream
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// One compiled rule: a prefix matcher plus a ready-to-use upstream client.
#[derive(Debug)]
pub struct CompiledRule {
    path_prefix: String,
    /// Scheme + authority of the upstream, no trailing slash
    origin: String,
    rewrite_origin: bool,
    client: reqwest::Client,
}

/// The ordered chain of compiled rules for one server instance
#[derive(Debug)]
pub struct RuleChain {
    rules: Vec<CompiledRule>,
}

/// Compile declarative rules into a chain of forwarders.
///
/// Each rule gets its own upstream client so that the TLS-verification
/// setting is fixed per rule at compile time. An unparseable target origin
/// is a compile error, surfaced to the caller as a failed start.
pub fn compile(rules: &[ProxyRule], upstream_timeout: Duration) -> anyhow::Result<RuleChain> {
    let mut compiled = Vec::with_capacity(rules.len());

    for rule in rules {
        let target = reqwest::Url::parse(&rule.target_origin).map_err(|e| {
            anyhow::anyhow!("invalid target origin '{}': {}", rule.target_origin, e)
        })?;

        if target.scheme() != "http" && target.scheme() != "https" {
            anyhow::bail!(
                "target origin '{}' must use http or https",
                rule.target_origin
            );
        }
        if target.host_str().is_none() {
            anyhow::bail!("target origin '{}' has no host", rule.target_origin);
        }

        let mut builder = reqwest::Client::builder().timeout(upstream_timeout);
        if !rule.verify_tls {
            builder = builder.danger_accept_invalid_certs(true);
        }
        let client = builder.build()?;

        compiled.push(CompiledRule {
            path_prefix: rule.path_prefix.clone(),
            origin: rule.target_origin.trim_end_matches('/').to_string(),
            rewrite_origin: rule.rewrite_origin,
            client,
        });
    }

    Ok(RuleChain { rules: compiled })
}

impl RuleChain {
    /// First rule whose prefix matches the request path, in configured order.
    /// Overlapping prefixes are resolved by ordering, not specificity, so
    /// operators can place "/api/v2" ahead of "/api" deliberately.
    pub fn matching(&self, path: &str) -> Option<&CompiledRule> {
        self.rules.iter().find(|r| path.starts_with(&r.path_prefix))
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

impl CompiledRule {
    pub fn path_prefix(&self) -> &str {
        &self.path_prefix
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn rewrites_origin(&self) -> bool {
        self.rewrite_origin
    }

    /// Forward a request to the upstream, preserving method, body, and
    /// headers. The caller has already collected the request body.
    pub async fn forward(
        &self,
        method: Method,
        path_and_query: &str,
        headers: &HeaderMap,
        body: Bytes,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>, reqwest::Error> {
        let url = format!("{}{}", self.origin, path_and_query);
        debug!(%method, %url, "Forwarding request upstream");

        let mut upstream_headers = HeaderMap::new();
        for (name, value) in headers {
            if is_hop_by_hop(name) {
                continue;
            }
            // Host and Origin point at this server; when the rule rewrites
            // the origin they must not leak through. Host is re-derived from
            // the upstream URL, Origin is rewritten below.
            if name == &hyper::header::HOST && self.rewrite_origin {
                continue;
            }
            if name == &hyper::header::ORIGIN && self.rewrite_origin {
                continue;
            }
            if name == &hyper::header::CONTENT_LENGTH {
                continue;
            }
            upstream_headers.append(name.clone(), value.clone());
        }

        if self.rewrite_origin && headers.contains_key(hyper::header::ORIGIN) {
            if let Ok(value) = HeaderValue::from_str(&self.origin) {
                upstream_headers.insert(hyper::header::ORIGIN, value);
            }
        }

        let response = self
            .client
            .request(method, url.as_str())
            .headers(upstream_headers)
            .body(body)
            .send()
            .await?;

        let status = response.status();
        let mut builder = Response::builder().status(status);
        for (name, value) in response.headers() {
            if is_hop_by_hop(name) || name == &hyper::header::CONTENT_LENGTH {
                continue;
            }
            builder = builder.header(name, value);
        }

        let bytes = response.bytes().await?;
        Ok(builder
            .body(Full::new(bytes).map_err(|never| match never {}).boxed())
            .expect("valid response from upstream parts"))
    }
}

fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP.contains(&name.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(prefix: &str, origin: &str) -> ProxyRule {
        ProxyRule {
            path_prefix: prefix.to_string(),
            target_origin: origin.to_string(),
            rewrite_origin: true,
            verify_tls: false,
        }
    }

    #[test]
    fn test_compile_empty_rules() {
        let chain = compile(&[], Duration::from_secs(5)).unwrap();
        assert!(chain.is_empty());
        assert!(chain.matching("/api/users").is_none());
    }

    #[test]
    fn test_compile_rejects_invalid_origin() {
        let rules = [rule("/api", "not a url")];
        assert!(compile(&rules, Duration::from_secs(5)).is_err());
    }

    #[test]
    fn test_compile_rejects_non_http_scheme() {
        let rules = [rule("/api", "ftp://files.example.com")];
        let err = compile(&rules, Duration::from_secs(5)).unwrap_err();
        assert!(err.to_string().contains("http or https"));
    }

    #[test]
    fn test_first_matching_prefix_wins() {
        let rules = [
            rule("/api/v2", "http://localhost:9002"),
            rule("/api", "http://localhost:9001"),
        ];
        let chain = compile(&rules, Duration::from_secs(5)).unwrap();

        assert_eq!(
            chain.matching("/api/v2/users").unwrap().origin(),
            "http://localhost:9002"
        );
        assert_eq!(
            chain.matching("/api/users").unwrap().origin(),
            "http://localhost:9001"
        );
        assert!(chain.matching("/assets/app.js").is_none());
    }

    #[test]
    fn test_rule_order_is_preserved_not_sorted() {
        // The shorter prefix shadows the longer one when listed first;
        // that is the contract, not a bug.
        let rules = [
            rule("/api", "http://localhost:9001"),
            rule("/api/v2", "http://localhost:9002"),
        ];
        let chain = compile(&rules, Duration::from_secs(5)).unwrap();

        assert_eq!(
            chain.matching("/api/v2/users").unwrap().origin(),
            "http://localhost:9001"
        );
    }

    #[test]
    fn test_origin_trailing_slash_trimmed() {
        let rules = [rule("/api", "http://localhost:9001/")];
        let chain = compile(&rules, Duration::from_secs(5)).unwrap();
        assert_eq!(chain.matching("/api").unwrap().origin(), "http://localhost:9001");
    }

    #[test]
    fn test_hop_by_hop_detection() {
        assert!(is_hop_by_hop(&HeaderName::from_static("connection")));
        assert!(is_hop_by_hop(&HeaderName::from_static("transfer-encoding")));
        assert!(!is_hop_by_hop(&HeaderName::from_static("content-type")));
        assert!(!is_hop_by_hop(&HeaderName::from_static("authorization")));
    }
}
