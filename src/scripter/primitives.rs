//! Host functions every script can call.
//!
//! | Function                     | Returns | Notes                                  |
//! |------------------------------|---------|----------------------------------------|
//! | `getRemoteAddr()`            | string  | peer `ip:port`                         |
//! | `getLocalAddr()`             | string  | local `ip:port`                        |
//! | `getDatetime()`              | string  | `YYYY-MM-DDTHH:MM:SS-00:00\n`          |
//! | `getFileDownload(url, path)` | string  | `"yes"` or `"no"`                      |
//! | `getAbTest(key)`             | string  | variant for `<service>_<key>`, or `_`  |
//! | `doLog(logType, message)`    | -       | logs with target `lua`                 |
//! | `doEvent(eventType, message)`| -       | emits a `scripter` event               |
//!
//! The address functions exist only in per-peer interpreters; `canHandle`
//! sniffing runs without a peer.

use std::fs::OpenOptions;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};

use super::connection::HostFunction;
use super::script_set::fingerprint;
use super::{lock, ScriptPeer};
use crate::abtest::AbTester;
use crate::event::{Event, SharedEventSink};

/// Most bytes `getFileDownload` keeps from a response body.
pub const DOWNLOAD_LIMIT: u64 = 1024;

/// Returned by `getAbTest` when the key has no variants.
pub const NO_VARIANT: &str = "_";

/// What the standard functions of one interpreter close over.
#[derive(Debug, Clone)]
pub struct PrimitiveContext {
    /// Service the scripts belong to; the A/B group.
    pub service: String,
    pub abtester: Option<Arc<AbTester>>,
    pub events: Option<SharedEventSink>,
    /// Relative download paths resolve against this directory.
    pub base_dir: PathBuf,
    pub peer: Option<Arc<Mutex<ScriptPeer>>>,
}

/// The standard host functions for `ctx`.
pub fn standard_functions(ctx: &PrimitiveContext) -> Vec<(&'static str, HostFunction)> {
    let mut functions = Vec::with_capacity(7);

    if let Some(peer) = &ctx.peer {
        let remote = Arc::clone(peer);
        functions.push((
            "getRemoteAddr",
            HostFunction::string(move |_| Ok(lock(&remote).remote.to_string())),
        ));
        let local = Arc::clone(peer);
        functions.push((
            "getLocalAddr",
            HostFunction::string(move |_| Ok(lock(&local).local.to_string())),
        ));
    }

    functions.push(("getDatetime", HostFunction::string(|_| Ok(datetime()))));

    let base_dir = ctx.base_dir.clone();
    functions.push((
        "getFileDownload",
        HostFunction::string(move |params| {
            let p = params.pop_named(&["url", "path"])?;
            let dir = base_dir.join(&p["path"]);
            match download(&p["url"], &dir) {
                Ok(file) => {
                    log::info!("Downloaded {} to {}", p["url"], file.display());
                    Ok("yes".to_string())
                }
                Err(e) => {
                    log::error!("Error downloading {}: {:#}", p["url"], e);
                    Ok("no".to_string())
                }
            }
        }),
    ));

    if let Some(abtester) = &ctx.abtester {
        let abtester = Arc::clone(abtester);
        let group = ctx.service.clone();
        functions.push((
            "getAbTest",
            HostFunction::string(move |params| {
                let p = params.pop_named(&["key"])?;
                Ok(abtester
                    .get_for_group(&group, &p["key"], None)
                    .unwrap_or_else(|e| {
                        log::debug!("getAbTest({}): {}", p["key"], e);
                        NO_VARIANT.to_string()
                    }))
            }),
        ));
    }

    let service = ctx.service.clone();
    functions.push((
        "doLog",
        HostFunction::void(move |params| {
            let p = params.pop_named(&["logType", "message"])?;
            script_log(&service, &p["logType"], &p["message"]);
            Ok(())
        }),
    ));

    if let Some(events) = &ctx.events {
        let events = Arc::clone(events);
        let service = ctx.service.clone();
        let peer = ctx.peer.clone();
        functions.push((
            "doEvent",
            HostFunction::void(move |params| {
                let p = params.pop_named(&["eventType", "message"])?;
                let mut event = Event::new("scripter", p["eventType"].as_str())
                    .custom("scripter.service", service.as_str())
                    .custom("scripter.message", p["message"].as_str());
                if let Some(peer) = &peer {
                    let peer = *lock(peer);
                    event = event.source(peer.remote).destination(peer.local);
                }
                events.send(event);
                Ok(())
            }),
        ));
    }

    functions
}

/// Current local time in the script datetime format.
pub fn datetime() -> String {
    chrono::Local::now()
        .format("%Y-%m-%dT%H:%M:%S-00:00\n")
        .to_string()
}

/// Fetch up to [`DOWNLOAD_LIMIT`] bytes of `url` and append them to
/// `<dir>/<sha256(url)>.txt`. Returns the file written.
pub fn download(url: &str, dir: &Path) -> Result<PathBuf> {
    let response = reqwest::blocking::get(url)
        .and_then(reqwest::blocking::Response::error_for_status)
        .with_context(|| format!("request to {url} failed"))?;

    let mut body = Vec::new();
    response
        .take(DOWNLOAD_LIMIT)
        .read_to_end(&mut body)
        .context("reading response body")?;

    std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    let path = dir.join(format!("{}.txt", fingerprint(url.as_bytes())));

    let mut options = OpenOptions::new();
    options.create(true).append(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options
        .open(&path)
        .with_context(|| format!("opening {}", path.display()))?;

    file.write_all(format!("{url}\n\n").as_bytes())?;
    file.write_all(&body)?;
    file.write_all(b"\n")?;
    Ok(path)
}

/// Route a script log line to the matching level.
///
/// `panic`, `fatal` and `critical` log at error level; unknown types log at
/// info.
fn script_log(service: &str, log_type: &str, message: &str) {
    match log_type {
        "debug" => log::debug!(target: "lua", "[{}] {}", service, message),
        "info" | "notice" => log::info!(target: "lua", "[{}] {}", service, message),
        "warning" | "warn" => log::warn!(target: "lua", "[{}] {}", service, message),
        "error" | "critical" | "fatal" | "panic" => {
            log::error!(target: "lua", "[{}] {}: {}", service, log_type, message);
        }
        other => log::info!(target: "lua", "[{}] ({}) {}", service, other, message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scripter::ParamStack;

    fn context(peer: Option<ScriptPeer>) -> PrimitiveContext {
        PrimitiveContext {
            service: "generic".into(),
            abtester: None,
            events: None,
            base_dir: PathBuf::from("."),
            peer: peer.map(|p| Arc::new(Mutex::new(p))),
        }
    }

    fn find<'a>(functions: &'a [(&'static str, HostFunction)], name: &str) -> Option<&'a HostFunction> {
        functions.iter().find(|(n, _)| *n == name).map(|(_, f)| f)
    }

    fn call_string(f: &HostFunction, args: &[&str]) -> String {
        let mut params: ParamStack = args.iter().copied().collect();
        match f {
            HostFunction::String(f) => f(&mut params).unwrap(),
            other => panic!("not a string function: {other:?}"),
        }
    }

    #[test]
    fn test_peer_functions_only_with_peer() {
        let without = standard_functions(&context(None));
        assert!(find(&without, "getRemoteAddr").is_none());
        assert!(find(&without, "doLog").is_some());

        let with = standard_functions(&context(Some(ScriptPeer {
            remote: "198.51.100.4:40000".parse().unwrap(),
            local: "10.0.0.1:23".parse().unwrap(),
        })));
        assert_eq!(
            call_string(find(&with, "getRemoteAddr").unwrap(), &[]),
            "198.51.100.4:40000"
        );
        assert_eq!(call_string(find(&with, "getLocalAddr").unwrap(), &[]), "10.0.0.1:23");
    }

    #[test]
    fn test_datetime_format() {
        let value = datetime();
        assert!(value.ends_with("-00:00\n"));
        assert_eq!(value.len(), "2017-01-02T03:04:05-00:00\n".len());
        assert_eq!(&value[4..5], "-");
        assert_eq!(&value[10..11], "T");
    }

    #[test]
    fn test_abtest_falls_back_to_sentinel() {
        let backend = crate::storage::MemoryBackend::new();
        let ab = Arc::new(AbTester::namespace(&backend, "lua").unwrap());
        ab.set_for_group("generic", "banner", "hello").unwrap();

        let mut ctx = context(None);
        ctx.abtester = Some(ab);
        let functions = standard_functions(&ctx);
        let get = find(&functions, "getAbTest").unwrap();

        assert_eq!(call_string(get, &["banner"]), "hello");
        assert_eq!(call_string(get, &["missing"]), NO_VARIANT);
    }

    #[test]
    fn test_do_event_sends_scripter_event() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let mut ctx = context(None);
        ctx.events = Some(Arc::new(tx));
        let functions = standard_functions(&ctx);

        let HostFunction::Void(f) = find(&functions, "doEvent").unwrap() else {
            panic!("doEvent must be void");
        };
        let mut params: ParamStack = ["login", "root:toor"].into_iter().collect();
        f(&mut params).unwrap();

        let event = rx.try_recv().unwrap();
        assert_eq!(event.kind, "login");
        assert_eq!(event.custom["scripter.message"], "root:toor");
    }

    #[test]
    fn test_do_log_requires_two_arguments() {
        let functions = standard_functions(&context(None));
        let HostFunction::Void(f) = find(&functions, "doLog").unwrap() else {
            panic!("doLog must be void");
        };
        let mut params: ParamStack = ["only message"].into_iter().collect();
        assert!(f(&mut params).is_err());

        let mut params: ParamStack = ["fatal", "kept running"].into_iter().collect();
        f(&mut params).unwrap();
    }

    #[test]
    fn test_failed_download_answers_no() {
        let tmp = tempfile::TempDir::new().unwrap();
        let mut ctx = context(None);
        ctx.base_dir = tmp.path().to_path_buf();
        let functions = standard_functions(&ctx);

        let reply = call_string(
            find(&functions, "getFileDownload").unwrap(),
            &["http://127.0.0.1:1/nothing", "downloads"],
        );
        assert_eq!(reply, "no");
    }
}
