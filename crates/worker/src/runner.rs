//! 作业运行器
//!
//! 以精确的 argv、完全替换的环境与指定工作目录启动子进程，
//! 捕获 stdout/stderr 并做限长截断。收到取消信号时向子进程发送
//! 终止信号，仍返回已捕获的输出。

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;

use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::broadcast;
use tracing::{info, warn};

use executr_domain::entities::JobResult;

/// 输出上限（字节）
const MAX_OUTPUT_SIZE: usize = 1024 * 1024;
/// 截断时保留的头部行数
const MAX_HEAD_LINES: usize = 500;

pub struct JobRunner {
    pub job_id: String,
    pub binary_path: PathBuf,
    pub arguments: Vec<String>,
    pub env_vars: HashMap<String, String>,
    pub work_dir: PathBuf,
}

impl JobRunner {
    /// 运行二进制直到退出或收到取消信号，总是返回一个结果。
    ///
    /// - argv 恰为 [binary, arguments...]，无 shell、无拆分
    /// - 子进程环境被 env_vars 完全替换，空映射则环境为空
    /// - 无法启动时 exit_code 为 -1，诊断追加到 stderr
    pub async fn execute(&self, mut shutdown_rx: broadcast::Receiver<()>) -> JobResult {
        info!(
            "执行作业: {} 二进制: {} 参数: {:?}",
            self.job_id,
            self.binary_path.display(),
            self.arguments
        );

        let mut child = match Command::new(&self.binary_path)
            .args(&self.arguments)
            .env_clear()
            .envs(&self.env_vars)
            .current_dir(&self.work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                return JobResult {
                    stdout: String::new(),
                    stderr: format!("\nExecution error: {e}"),
                    exit_code: -1,
                };
            }
        };

        // 输出读取与子进程等待并行，避免管道写满阻塞子进程
        let stdout_pipe = child.stdout.take();
        let stderr_pipe = child.stderr.take();
        let stdout_task = tokio::spawn(read_to_end(stdout_pipe));
        let stderr_task = tokio::spawn(read_to_end(stderr_pipe));

        // 等待退出或取消；wait future 限制在内层块里，
        // 块结束后 child 的借用释放，取消路径才能再操作它
        enum WaitOutcome {
            Exited(std::io::Result<std::process::ExitStatus>),
            Cancelled,
        }
        let outcome = {
            let wait = child.wait();
            tokio::pin!(wait);
            tokio::select! {
                status = &mut wait => WaitOutcome::Exited(status),
                _ = shutdown_rx.recv() => WaitOutcome::Cancelled,
            }
        };

        let status = match outcome {
            WaitOutcome::Exited(status) => status,
            WaitOutcome::Cancelled => {
                warn!("作业 {} 收到取消信号，终止子进程", self.job_id);
                if let Err(e) = child.start_kill() {
                    warn!("终止子进程失败: {}", e);
                }
                child.wait().await
            }
        };

        let exit_code = match status {
            // 被信号终止时没有退出码
            Ok(status) => status.code().unwrap_or(-1),
            Err(e) => {
                warn!("等待子进程失败: {}", e);
                -1
            }
        };

        let stdout = stdout_task.await.unwrap_or_default();
        let stderr = stderr_task.await.unwrap_or_default();

        let result = JobResult {
            stdout: truncate_output(&stdout),
            stderr: truncate_output(&stderr),
            exit_code,
        };

        info!(
            "作业执行结束: {} 退出码: {} stdout {} 字节, stderr {} 字节",
            self.job_id,
            result.exit_code,
            result.stdout.len(),
            result.stderr.len()
        );

        result
    }
}

async fn read_to_end(pipe: Option<impl tokio::io::AsyncRead + Unpin>) -> String {
    let Some(mut pipe) = pipe else {
        return String::new();
    };
    let mut buf = Vec::new();
    let _ = pipe.read_to_end(&mut buf).await;
    String::from_utf8_lossy(&buf).into_owned()
}

/// 在不超过 cap 的前提下按字节截断，保证落在字符边界上
fn truncate_bytes(s: &str, cap: usize) -> &str {
    if s.len() <= cap {
        return s;
    }
    let mut end = cap;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// 输出截断
///
/// 容量内原样返回；行数不超过头部额度时按字节截断；
/// 否则保留前 500 行、插入截断标记行，再从尾部回填尽可能多的完整行。
pub fn truncate_output(output: &str) -> String {
    if output.len() <= MAX_OUTPUT_SIZE {
        return output.to_string();
    }

    let lines: Vec<&str> = output.split('\n').collect();

    if lines.len() <= MAX_HEAD_LINES {
        return truncate_bytes(output, MAX_OUTPUT_SIZE).to_string();
    }

    let mut result = lines[..MAX_HEAD_LINES].join("\n");
    result.push_str(&format!(
        "\n... [OUTPUT TRUNCATED - Total {} bytes, {} lines] ...\n",
        output.len(),
        lines.len()
    ));

    let remaining = MAX_OUTPUT_SIZE.saturating_sub(result.len());
    if remaining == 0 {
        return truncate_bytes(&result, MAX_OUTPUT_SIZE).to_string();
    }

    // 从末尾往回收集放得下的完整行
    let mut tail_start = lines.len();
    let mut tail_size = 0usize;
    for i in (MAX_HEAD_LINES..lines.len()).rev() {
        let line_size = lines[i].len() + 1;
        if tail_size + line_size > remaining {
            break;
        }
        tail_size += line_size;
        tail_start = i;
    }

    if tail_start < lines.len() {
        result.push_str(&lines[tail_start..].join("\n"));
    }

    result
}
