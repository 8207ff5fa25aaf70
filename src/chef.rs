//! Chef server interaction.
//!
//! Node registration itself happens on the instance: its user data runs `chef-client` against the
//! validation key. From here we only clear out stale registrations that would stop a rebuilt
//! node from re-registering under the same name, and look nodes up afterwards. Both go through
//! `knife`, using the `knife.rb` in the configured chef directory.

use color_eyre::Report;
use eyre::WrapErr;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use crate::ssh::CommandOutput;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::instrument;

/// First-boot node attributes, as handed to `chef-client -j`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Attributes(Map<String, Value>);

impl Attributes {
    /// Set `value` at the dot-separated `path`, creating intermediate objects as needed.
    ///
    /// Any non-object value found along the path is replaced by an object.
    pub fn set_dotted(&mut self, path: &str, value: impl Into<Value>) -> &mut Self {
        let mut parts: Vec<&str> = path.split('.').collect();
        let last = parts.pop().unwrap_or(path);
        let mut cur = &mut self.0;
        for part in parts {
            let entry = cur
                .entry(part.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !entry.is_object() {
                *entry = Value::Object(Map::new());
            }
            cur = match entry {
                Value::Object(m) => m,
                _ => unreachable!("replaced with an object above"),
            };
        }
        cur.insert(last.to_string(), value.into());
        self
    }

    pub fn get_dotted(&self, path: &str) -> Option<&Value> {
        let mut parts = path.split('.');
        let mut cur = self.0.get(parts.next()?)?;
        for part in parts {
            cur = cur.as_object()?.get(part)?;
        }
        Some(cur)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn to_json(&self) -> Result<String, Report> {
        serde_json::to_string(&self.0).wrap_err("failed to serialize node attributes")
    }
}

/// The parts of a Chef node we care about.
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct Node {
    pub name: String,
    pub chef_environment: String,
    #[serde(default)]
    pub run_list: Vec<String>,
}

/// Lower-case every run-list entry, as Chef 12 servers require.
pub fn lowercase_run_list(run_list: &[String]) -> Vec<String> {
    run_list.iter().map(|r| r.to_lowercase()).collect()
}

/// Whether `ls -l /var/log` output shows the chef-client log.
pub fn log_present(listing: &str, log_file: &str) -> bool {
    let file_name = Path::new(log_file)
        .file_name()
        .and_then(|f| f.to_str())
        .unwrap_or(log_file);
    listing.contains(file_name)
}

/// Whether the tail of the chef-client log reports a completed run.
pub fn run_succeeded(log_tail: &str) -> bool {
    log_tail.contains("Chef Run complete in")
}

/// Follow a node's first chef-client run through `run`, a remote shell, polling every
/// `interval`. Returns whether the run succeeded.
///
/// Waits for `log_file` to appear, then for `chef-client` to exit, then reads the log's tail.
pub async fn await_first_run<R, Fut>(
    mut run: R,
    log_file: &str,
    interval: Duration,
) -> Result<bool, Report>
where
    R: FnMut(String) -> Fut,
    Fut: Future<Output = Result<CommandOutput, Report>>,
{
    let log_dir = Path::new(log_file)
        .parent()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "/var/log".to_string());

    tracing::info!("waiting for Chef client to start");
    while !log_present(&run(format!("ls -l {}", log_dir)).await?.stdout, log_file) {
        tokio::time::sleep(interval).await;
    }
    tracing::info!("Chef client has started");

    tracing::info!("waiting for Chef client to finish");
    while !run("pgrep chef-client".to_string()).await?.stdout.trim().is_empty() {
        tokio::time::sleep(interval).await;
    }
    tracing::info!("Chef client has finished");

    let tail = run(format!("tail {}", log_file)).await?.stdout;
    if run_succeeded(&tail) {
        tracing::info!("Chef client was successful");
        Ok(true)
    } else {
        tracing::warn!("Chef client was not successful");
        tracing::debug!(log = %tail, "tail of chef log");
        Ok(false)
    }
}

// knife reports a missing object as a 404; Chef 12 answers 403 for clients that do not exist.
fn is_absent(stderr: &str) -> bool {
    stderr.contains("404") || stderr.contains("Not Found") || stderr.contains("Forbidden")
}

/// A thin wrapper over the `knife` CLI.
#[derive(Clone, Debug)]
pub struct Knife {
    config: PathBuf,
}

impl Knife {
    /// Use the `knife.rb` found in `chef_path`.
    pub fn new(chef_path: &Path) -> Self {
        Knife {
            config: chef_path.join("knife.rb"),
        }
    }

    async fn knife(&self, args: &[&str]) -> Result<std::process::Output, Report> {
        tokio::process::Command::new("knife")
            .args(args)
            .arg("-c")
            .arg(&self.config)
            .output()
            .await
            .wrap_err("failed to run knife")
    }

    /// Delete `kind` (`node` or `client`) called `name`. Returns whether anything was deleted.
    async fn delete(&self, kind: &str, name: &str) -> Result<bool, Report> {
        let out = self.knife(&[kind, "delete", name, "-y"]).await?;
        if out.status.success() {
            return Ok(true);
        }

        let stderr = String::from_utf8_lossy(&out.stderr);
        if is_absent(&stderr) {
            Ok(false)
        } else {
            Err(eyre::eyre!("{}", stderr.trim()))
                .wrap_err_with(|| format!("failed to delete chef {} {}", kind, name))
        }
    }

    #[instrument(level = "debug", skip(self))]
    pub async fn delete_node(&self, name: &str) -> Result<bool, Report> {
        self.delete("node", name).await
    }

    #[instrument(level = "debug", skip(self))]
    pub async fn delete_client(&self, name: &str) -> Result<bool, Report> {
        self.delete("client", name).await
    }

    /// Look up a registered node. `Ok(None)` if the server does not know it.
    #[instrument(level = "debug", skip(self))]
    pub async fn show_node(&self, name: &str) -> Result<Option<Node>, Report> {
        let out = self.knife(&["node", "show", name, "-l", "-F", "json"]).await?;
        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr);
            if is_absent(&stderr) {
                return Ok(None);
            }
            return Err(eyre::eyre!("{}", stderr.trim()))
                .wrap_err_with(|| format!("failed to look up chef node {}", name));
        }

        let node = serde_json::from_slice(&out.stdout)
            .wrap_err_with(|| format!("knife returned unparseable node {}", name))?;
        Ok(Some(node))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn dotted_paths_nest() {
        let mut a = Attributes::default();
        a.set_dotted("mongodb.cluster_name", "video")
            .set_dotted("mongodb.config.smallfiles", true)
            .set_dotted("solr.is_master", "true");
        assert_eq!(
            serde_json::to_value(&a).unwrap(),
            json!({
                "mongodb": { "cluster_name": "video", "config": { "smallfiles": true } },
                "solr": { "is_master": "true" },
            })
        );
        assert_eq!(a.get_dotted("mongodb.config.smallfiles"), Some(&json!(true)));
        assert_eq!(a.get_dotted("mongodb.nope"), None);
    }

    #[test]
    fn dotted_paths_replace_scalars() {
        let mut a = Attributes::default();
        a.set_dotted("rabbitmq", "flat").set_dotted("rabbitmq.user", "guest");
        assert_eq!(a.get_dotted("rabbitmq.user"), Some(&json!("guest")));
    }

    #[test]
    fn run_list_lowercasing() {
        let rl = vec!["role[RoleMongo]".to_string(), "role[RoleSumoLogic]".to_string()];
        assert_eq!(
            lowercase_run_list(&rl),
            vec!["role[rolemongo]", "role[rolesumologic]"]
        );
    }

    #[test]
    fn log_inspection() {
        let ls = "-rw-r--r-- 1 root root 5120 Jan  1 00:00 chef-client.log\n";
        assert!(log_present(ls, "/var/log/chef-client.log"));
        assert!(!log_present("messages\nsecure\n", "/var/log/chef-client.log"));

        assert!(run_succeeded("[2016-01-01] INFO: Chef Run complete in 312.2 seconds\n"));
        assert!(!run_succeeded("[2016-01-01] ERROR: Running exception handlers\n"));
    }

    // a remote shell that answers from a script and records what it was asked
    fn shell(
        script: Vec<&'static str>,
    ) -> (
        std::rc::Rc<std::cell::RefCell<Vec<String>>>,
        impl FnMut(String) -> futures_util::future::Ready<Result<CommandOutput, Report>>,
    ) {
        let asked = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
        let log = asked.clone();
        let mut script = script.into_iter();
        let run = move |cmd: String| {
            log.borrow_mut().push(cmd);
            futures_util::future::ready(match script.next() {
                Some(stdout) => Ok(CommandOutput {
                    stdout: stdout.to_string(),
                    stderr: String::new(),
                    success: true,
                }),
                None => Err(eyre::eyre!("connection closed")),
            })
        };
        (asked, run)
    }

    #[test]
    fn first_run_is_followed_to_completion() -> Result<(), Report> {
        let rt = tokio::runtime::Runtime::new()?;
        let (asked, run) = shell(vec![
            "messages\nsecure\n",
            "messages\nchef-client.log\n",
            "1234\n",
            "",
            "INFO: Chef Run complete in 312.2 seconds\n",
        ]);
        let ok = rt.block_on(await_first_run(
            run,
            "/var/log/chef-client.log",
            Duration::from_millis(0),
        ))?;
        assert!(ok);
        assert_eq!(
            *asked.borrow(),
            vec![
                "ls -l /var/log",
                "ls -l /var/log",
                "pgrep chef-client",
                "pgrep chef-client",
                "tail /var/log/chef-client.log",
            ]
        );
        Ok(())
    }

    #[test]
    fn failed_first_run() -> Result<(), Report> {
        let rt = tokio::runtime::Runtime::new()?;
        let (asked, run) = shell(vec![
            "chef-client.log\n",
            "",
            "ERROR: Running exception handlers\n",
        ]);
        let ok = rt.block_on(await_first_run(
            run,
            "/var/log/chef-client.log",
            Duration::from_millis(0),
        ))?;
        assert!(!ok);
        assert_eq!(asked.borrow().len(), 3);
        Ok(())
    }

    #[test]
    fn lost_connection_fails_the_wait() -> Result<(), Report> {
        let rt = tokio::runtime::Runtime::new()?;
        let (asked, run) = shell(vec!["", ""]);
        let r = rt.block_on(await_first_run(
            run,
            "/var/log/chef-client.log",
            Duration::from_millis(0),
        ));
        assert!(r.is_err());
        assert_eq!(asked.borrow().len(), 3);
        Ok(())
    }

    #[test]
    fn node_parses_from_knife_json() {
        let raw = r#"{"name":"t-g-mongo-use1c-01","chef_environment":"test","run_list":["role[RoleMongo]"],"normal":{}}"#;
        let node: Node = serde_json::from_str(raw).unwrap();
        assert_eq!(node.name, "t-g-mongo-use1c-01");
        assert_eq!(node.run_list, vec!["role[RoleMongo]"]);
    }

    #[test]
    fn missing_objects_are_recognised() {
        assert!(is_absent("ERROR: The object you are looking for could not be found\nResponse: 404 Not Found"));
        assert!(is_absent("ERROR: You are not authorized for this action\nResponse: 403 Forbidden"));
        assert!(!is_absent("ERROR: Connection refused"));
    }
}
