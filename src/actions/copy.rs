// Copy a local file or inline content to the host, skipping the transfer
// when the remote checksum already matches

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use tracing::debug;

use super::{merged_args, result_map, ActionHandler, ActionInput};
use crate::executor::{HostSession, ReturnData};
use crate::output::diff::file_diff;
use crate::output::errors::RunnerError;
use crate::value::{boolean, to_plain_string};

/// Checksum probe status: destination missing
const CHECKSUM_MISSING: &str = "1";
const CHECKSUM_DIRECTORY: &str = "3";
const CHECKSUM_NO_TOOL: &str = "4";

pub struct CopyAction;

pub fn sha256_hex(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}

fn failed(host: &str, msg: impl Into<String>) -> ReturnData {
    ReturnData::new(host, result_map(json!({"failed": true, "msg": msg.into()})))
}

struct Source {
    content: String,
    /// Local path, when copying a file rather than inline content
    path: Option<PathBuf>,
}

fn load_source(session: &HostSession<'_>, args: &Map<String, Value>) -> Result<Result<Source, String>, RunnerError> {
    let src = args.get("src").map(to_plain_string);
    let content = args.get("content");

    match (src, content) {
        (Some(_), Some(_)) => Ok(Err("src and content are mutually exclusive".into())),
        (None, None) => Ok(Err("src (or content) and dest are required".into())),
        (None, Some(content)) => {
            let content = match content {
                Value::String(s) => s.clone(),
                other => serde_json::to_string(other)?,
            };
            Ok(Ok(Source { content, path: None }))
        }
        (Some(src), None) => {
            let mut path = PathBuf::from(&src);
            if path.is_relative() {
                path = session.ctx.playbook_dir.join(path);
            }
            if path.is_dir() {
                return Ok(Err(format!("recursive copy of directory {} is not supported", src)));
            }
            match std::fs::read_to_string(&path) {
                Ok(content) => Ok(Ok(Source {
                    content,
                    path: Some(path),
                })),
                Err(e) => Ok(Err(format!("could not read source {}: {}", path.display(), e))),
            }
        }
    }
}

#[async_trait]
impl ActionHandler for CopyAction {
    fn name(&self) -> &'static str {
        "copy"
    }

    fn transfers_files(&self) -> bool {
        true
    }

    async fn run(
        &self,
        session: &mut HostSession<'_>,
        input: ActionInput<'_>,
    ) -> Result<ReturnData, RunnerError> {
        let host = session.host.clone();
        let args = merged_args(input.module_args, input.complex_args)?;

        let Some(dest) = args.get("dest").map(to_plain_string) else {
            return Ok(failed(&host, "src (or content) and dest are required"));
        };
        let source = match load_source(session, &args)? {
            Ok(source) => source,
            Err(msg) => return Ok(failed(&host, msg)),
        };
        let force = args.get("force").map(boolean).unwrap_or(true);
        let mode = args.get("mode").map(to_plain_string);

        let local_checksum = sha256_hex(source.content.as_bytes());
        let mut dest = session.remote_expand_user(&dest).await?;
        let mut remote_checksum = session.remote_checksum(&dest).await?;

        if remote_checksum == CHECKSUM_DIRECTORY {
            let Some(name) = source.path.as_deref().and_then(Path::file_name) else {
                return Ok(failed(&host, "can not use content with a dir as dest"));
            };
            dest = session.shell.join_path(&[&dest, &name.to_string_lossy()]);
            remote_checksum = session.remote_checksum(&dest).await?;
        }
        if remote_checksum == CHECKSUM_NO_TOOL {
            return Ok(failed(&host, "no sha256 tool available on the remote host"));
        }
        if remote_checksum != CHECKSUM_MISSING && !force {
            return Ok(ReturnData::new(
                host,
                result_map(json!({"changed": false, "dest": dest, "msg": "file already exists"})),
            ));
        }

        // INVALIDCHECKSUM never matches, so an unreadable probe means transfer
        if remote_checksum == local_checksum {
            if let (Some(mode), false) = (&mode, session.task.check) {
                let cmd = session.shell.chmod(mode, &dest);
                session.low_level_exec(&cmd, true, None, None).await?;
            }
            return Ok(ReturnData::new(
                host,
                result_map(json!({"changed": false, "dest": dest, "checksum": local_checksum})),
            ));
        }

        let diff = if session.task.diff {
            let before = if remote_checksum == CHECKSUM_MISSING {
                String::new()
            } else {
                let cat = format!("cat {}", shell_words::quote(&dest));
                session.low_level_exec(&cat, true, None, None).await?.stdout
            };
            let after_header = source
                .path
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "dynamically generated".to_string());
            Some(file_diff(&before, &source.content, &dest, &after_header))
        } else {
            None
        };

        if session.task.check {
            return Ok(ReturnData::new(host, result_map(json!({"changed": true, "dest": dest}))).with_diff(diff));
        }

        let tmp = session.ensure_tmp().await?;
        let staged = session.transfer_str(&tmp, "source", &source.content).await?;
        let mut cmd = format!("cp {} {}", shell_words::quote(&staged), shell_words::quote(&dest));
        if let Some(mode) = &mode {
            cmd.push_str(" && ");
            cmd.push_str(&session.shell.chmod(mode, &dest));
        }
        if session.target.becomes_unprivileged() {
            session.remote_chmod("a+r", &staged, false).await?;
        }
        debug!(host = %host, dest = %dest, "copying staged file");
        let res = session.low_level_exec(&cmd, true, None, None).await?;

        let mut result = json!({
            "changed": true,
            "dest": dest,
            "checksum": local_checksum,
        });
        if !res.success() {
            result["failed"] = json!(true);
            result["rc"] = json!(res.exit_code);
            result["msg"] = json!(res.stderr.trim());
        }
        Ok(ReturnData::new(host, result_map(result)).with_diff(diff))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::testing::{exited, MockConnector};
    use crate::executor::{Runner, TaskSpec};
    use crate::inventory::{Host, Inventory};
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    fn inventory() -> Inventory {
        let mut inv = Inventory::new();
        inv.add_host(Host::new("web1"));
        inv
    }

    #[tokio::test]
    async fn test_copy_content_when_checksum_differs() {
        let mock = MockConnector::new();
        mock.reply_seq("sha256sum", vec![exited(0, "0000  /etc/motd\n", "")]);
        let ctx = mock.context(inventory()).build();

        let task = TaskSpec::new("copy", "dest=/etc/motd mode=0644").complex_args(result_map(json!({"content": "hi\n"})));
        let results = Runner::new(ctx, Arc::new(task)).run().await.unwrap();

        let result = &results.contacted["web1"];
        assert_eq!(result["changed"], json!(true));
        assert_eq!(result["checksum"], json!(sha256_hex(b"hi\n")));
        let puts = mock.puts();
        assert_eq!(puts.len(), 1);
        assert!(puts[0].remote.ends_with("/source"));
        assert_eq!(puts[0].content, "hi\n");
        let cp = &mock.commands_matching("cp ")[0];
        assert!(cp.cmd.contains("/etc/motd && chmod 0644 /etc/motd"));
        // Temp path is removed after the action
        assert!(mock.commands().last().unwrap().cmd.starts_with("rm -rf "));
    }

    #[tokio::test]
    async fn test_copy_skips_matching_checksum() {
        let mock = MockConnector::new();
        let sum = sha256_hex(b"hi\n");
        mock.reply("sha256sum", &format!("{}  /etc/motd\n", sum));
        let ctx = mock.context(inventory()).build();

        let task = TaskSpec::new("copy", "dest=/etc/motd").complex_args(result_map(json!({"content": "hi\n"})));
        let results = Runner::new(ctx, Arc::new(task)).run().await.unwrap();

        assert_eq!(results.contacted["web1"]["changed"], json!(false));
        assert!(mock.puts().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_checksum_assumes_changed() {
        let mock = MockConnector::new();
        mock.reply("sha256sum", "");
        let ctx = mock.context(inventory()).build();

        let task = TaskSpec::new("copy", "dest=/etc/motd").complex_args(result_map(json!({"content": "x"})));
        let results = Runner::new(ctx, Arc::new(task)).run().await.unwrap();

        assert_eq!(results.contacted["web1"]["changed"], json!(true));
        assert_eq!(mock.puts().len(), 1);
    }

    #[tokio::test]
    async fn test_directory_dest_uses_source_basename() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("app.conf"), "port=80\n").unwrap();

        let mock = MockConnector::new();
        mock.reply_seq(
            "sha256sum",
            vec![exited(0, "3  /etc/app\n", ""), exited(0, "1  /etc/app/app.conf\n", "")],
        );
        let ctx = mock.context(inventory()).playbook_dir(dir.path()).build();

        let task = TaskSpec::new("copy", "src=app.conf dest=/etc/app").check(true).diff(true);
        let results = Runner::new(ctx, Arc::new(task)).run().await.unwrap();

        let result = &results.contacted["web1"];
        assert_eq!(result["dest"], json!("/etc/app/app.conf"));
        assert_eq!(result["changed"], json!(true));
        // Check mode reports the change without transferring
        assert!(mock.puts().is_empty());
        assert!(mock.commands_matching("cp ").is_empty());
    }

    #[tokio::test]
    async fn test_missing_dest_fails() {
        let mock = MockConnector::new();
        let ctx = mock.context(inventory()).build();

        let task = TaskSpec::new("copy", "src=a.txt");
        let results = Runner::new(ctx, Arc::new(task)).run().await.unwrap();
        assert_eq!(results.contacted["web1"]["failed"], json!(true));
    }
}
