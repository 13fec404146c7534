//! Package-index availability collaborator.
//!
//! After a Go module is tagged, dependents can only resolve it once the
//! module proxy has fetched the tag. [`GoProxy`] polls the proxy's `.info`
//! endpoint until the version is served.

use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use reqwest::StatusCode;
use reqwest::blocking::Client;

use crate::process::CancelToken;

pub trait ModuleIndex: Send + Sync {
    fn wait_for_module(&self, module_path: &str, version: &str, cancel: &CancelToken) -> Result<()>;
}

/// Go's module path case-encoding: each uppercase letter becomes `!` plus
/// its lowercase form.
pub fn escape_module_path(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    for c in path.chars() {
        if c.is_ascii_uppercase() {
            out.push('!');
            out.push(c.to_ascii_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Availability {
    Available,
    /// The proxy answered but does not serve the version yet.
    Missing,
    Unreachable(String),
}

pub struct GoProxy {
    proxy_url: String,
    http: Client,
    poll_interval: Duration,
    timeout: Duration,
}

impl GoProxy {
    pub fn new(proxy_url: impl Into<String>, poll_interval: Duration, timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .user_agent(format!("convoy/{}", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(30))
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            proxy_url: proxy_url.into(),
            http,
            poll_interval,
            timeout,
        })
    }

    pub fn info_url(&self, module_path: &str, version: &str) -> String {
        format!(
            "{}/{}/@v/{}.info",
            self.proxy_url.trim_end_matches('/'),
            escape_module_path(module_path),
            escape_module_path(version)
        )
    }

    /// One look at the proxy. Network failures are [`Availability::Unreachable`];
    /// only a status that will not change by waiting is an error.
    pub fn check(&self, module_path: &str, version: &str) -> Result<Availability> {
        let resp = match self.http.get(self.info_url(module_path, version)).send() {
            Ok(resp) => resp,
            Err(e) => return Ok(Availability::Unreachable(format!("module proxy request failed: {e}"))),
        };
        match resp.status() {
            StatusCode::OK => Ok(Availability::Available),
            StatusCode::NOT_FOUND | StatusCode::GONE => Ok(Availability::Missing),
            s if s.is_server_error() || s == StatusCode::TOO_MANY_REQUESTS => {
                Ok(Availability::Unreachable(format!("module proxy answered {s}")))
            }
            s => bail!("unexpected status while checking {module_path}@{version}: {s}"),
        }
    }
}

impl ModuleIndex for GoProxy {
    fn wait_for_module(&self, module_path: &str, version: &str, cancel: &CancelToken) -> Result<()> {
        let started = Instant::now();
        let mut last_error: Option<String> = None;
        loop {
            if cancel.is_cancelled() {
                bail!("cancelled while waiting for {module_path}@{version} on the module proxy");
            }
            match self.check(module_path, version)? {
                Availability::Available => return Ok(()),
                Availability::Missing => last_error = None,
                Availability::Unreachable(reason) => last_error = Some(reason),
            }
            if started.elapsed() >= self.timeout {
                let mut message = format!(
                    "{module_path}@{version} not available on {} after {}",
                    self.proxy_url,
                    humantime::format_duration(self.timeout)
                );
                if let Some(reason) = &last_error {
                    message.push_str(&format!(" (last error: {reason})"));
                }
                bail!(message);
            }
            if !cancel.sleep(self.poll_interval) {
                bail!("cancelled while waiting for {module_path}@{version} on the module proxy");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use tiny_http::{Response, Server, StatusCode as HttpStatus};

    use super::*;

    fn spawn_server(statuses: Vec<u16>) -> (String, thread::JoinHandle<Vec<String>>) {
        let server = Server::http("127.0.0.1:0").expect("server");
        let base_url = format!("http://{}", server.server_addr());
        let handle = thread::spawn(move || {
            let mut urls = Vec::new();
            for status in statuses {
                let req = server.recv().expect("request");
                urls.push(req.url().to_string());
                let body = if status == 200 {
                    r#"{"Version":"v1.2.0","Time":"2026-01-01T00:00:00Z"}"#
                } else {
                    "not found"
                };
                req.respond(Response::from_string(body).with_status_code(HttpStatus(status)))
                    .expect("respond");
            }
            urls
        });
        (base_url, handle)
    }

    #[test]
    fn escapes_uppercase() {
        assert_eq!(escape_module_path("github.com/Azure/Go-SDK"), "github.com/!azure/!go-!s!d!k");
        assert_eq!(escape_module_path("example.com/plain"), "example.com/plain");
    }

    #[test]
    fn polls_until_the_version_appears() {
        let (base, handle) = spawn_server(vec![404, 503, 410, 200]);
        let proxy = GoProxy::new(base, Duration::from_millis(5), Duration::from_secs(5)).expect("proxy");
        proxy
            .wait_for_module("example.com/Acme/base", "v1.2.0", &CancelToken::new())
            .expect("available");

        let urls = handle.join().expect("join");
        assert_eq!(urls.len(), 4);
        assert_eq!(urls[0], "/example.com/!acme/base/@v/v1.2.0.info");
    }

    #[test]
    fn times_out_naming_the_module() {
        let (base, handle) = spawn_server(vec![404]);
        let proxy = GoProxy::new(base, Duration::from_millis(5), Duration::ZERO).expect("proxy");
        let err = proxy
            .wait_for_module("example.com/base", "v1.2.0", &CancelToken::new())
            .expect_err("must time out");
        assert!(format!("{err:#}").contains("example.com/base@v1.2.0"));
        handle.join().expect("join");
    }

    #[test]
    fn unexpected_status_is_fatal() {
        let (base, handle) = spawn_server(vec![403]);
        let proxy = GoProxy::new(base, Duration::from_millis(5), Duration::from_secs(5)).expect("proxy");
        assert!(proxy.wait_for_module("example.com/base", "v1.2.0", &CancelToken::new()).is_err());
        handle.join().expect("join");
    }

    #[test]
    fn unreachable_proxy_is_polled_until_the_timeout() {
        let proxy = GoProxy::new("http://127.0.0.1:1", Duration::from_millis(10), Duration::from_millis(200))
            .expect("proxy");
        let started = Instant::now();
        let err = proxy
            .wait_for_module("example.com/base", "v1.2.0", &CancelToken::new())
            .expect_err("must time out");
        assert!(started.elapsed() >= Duration::from_millis(200));
        let msg = format!("{err:#}");
        assert!(msg.contains("not available"), "{msg}");
        assert!(msg.contains("last error: module proxy request failed"), "{msg}");
    }

    #[test]
    fn cancellation_stops_polling() {
        let proxy = GoProxy::new("http://127.0.0.1:9", Duration::from_millis(5), Duration::from_secs(5))
            .expect("proxy");
        let cancel = CancelToken::new();
        cancel.cancel();
        let err = proxy.wait_for_module("example.com/base", "v1.2.0", &cancel).expect_err("cancelled");
        assert!(format!("{err:#}").contains("cancelled"));
    }
}
