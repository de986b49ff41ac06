//! Process backend against fake agent scripts.
#![cfg(unix)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use futures::StreamExt;
use openbridge_protocol::anthropic::{ContentBlock, MessagesRequest, NativeMessage, StopReason};
use openbridge_proxy::backend::{Backend, BackendEvent, CliBackend, Execution};
use openbridge_proxy::{BackendKind, ProxyConfig, ProxyError};
use tempfile::TempDir;

// Writing an executable while another test forks can fail with ETXTBSY.
static SERIAL: Mutex<()> = Mutex::new(());

fn serial() -> MutexGuard<'static, ()> {
    SERIAL.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write_agent(dir: &Path, body: &str) -> PathBuf {
    let path = dir.join("agent");
    fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn cli_backend(binary: PathBuf, timeout_secs: u64) -> CliBackend {
    CliBackend::new(&ProxyConfig {
        backend: BackendKind::Cli,
        cli_binary: binary,
        cli_timeout_secs: timeout_secs,
        ..Default::default()
    })
}

fn request(system: Option<&str>) -> MessagesRequest {
    prompt_request("hi", system)
}

fn prompt_request(prompt: &str, system: Option<&str>) -> MessagesRequest {
    MessagesRequest {
        model: "claude-sonnet-4-5".to_string(),
        max_tokens: 256,
        messages: vec![NativeMessage::user_text(prompt)],
        system: system.map(str::to_string),
        tools: vec![],
        tool_choice: None,
        stream: false,
        temperature: None,
        top_p: None,
        stop_sequences: vec![],
    }
}

async fn collect_stream(execution: Execution) -> Vec<Result<BackendEvent, ProxyError>> {
    match execution {
        Execution::Streaming(events) => events.collect().await,
        Execution::Completed(result) => panic!("expected a stream, got {result:?}"),
    }
}

fn texts(events: &[Result<BackendEvent, ProxyError>]) -> String {
    events
        .iter()
        .filter_map(|e| match e {
            Ok(BackendEvent::Text(t)) => Some(t.as_str()),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn json_result_is_parsed_and_arguments_are_passed() {
    let _guard = serial();
    let dir = TempDir::new().unwrap();
    let args_file = dir.path().join("args");
    let agent = write_agent(
        dir.path(),
        &format!(
            r#"for arg in "$@"; do printf '%s\n' "$arg"; done > {}
echo '{{"type":"result","subtype":"success","is_error":false,"result":"Hello from agent","usage":{{"input_tokens":12,"output_tokens":4}}}}'"#,
            args_file.display()
        ),
    );

    let execution = cli_backend(agent, 10)
        .execute(request(Some("be brief")), false)
        .await
        .unwrap();
    let Execution::Completed(result) = execution else {
        panic!("expected a completed result");
    };
    assert_eq!(result.content, vec![ContentBlock::text("Hello from agent")]);
    assert_eq!(result.stop_reason, Some(StopReason::EndTurn));
    let usage = result.usage.unwrap();
    assert_eq!((usage.input_tokens, usage.output_tokens), (12, 4));

    let args = fs::read_to_string(&args_file).unwrap();
    let args: Vec<&str> = args.lines().collect();
    assert_eq!(
        args,
        vec![
            "-p",
            "--model",
            "claude-sonnet-4-5",
            "--system-prompt",
            "be brief",
            "--output-format",
            "json",
            "--",
            "hi"
        ]
    );
}

#[tokio::test]
async fn prompt_starting_with_a_dash_stays_positional() {
    let _guard = serial();
    let dir = TempDir::new().unwrap();
    // Replies with its last argument and fails on any unexpected option.
    let agent = write_agent(
        dir.path(),
        r#"seen_separator=0
for arg in "$@"; do
  if [ "$seen_separator" = 0 ]; then
    case "$arg" in
      --) seen_separator=1 ;;
      -p|--model|--output-format|claude-sonnet-4-5|json) ;;
      *) echo "unknown option: $arg" >&2; exit 64 ;;
    esac
  fi
  last="$arg"
done
printf '{"type":"result","subtype":"success","result":"%s"}\n' "$last""#,
    );

    let Execution::Completed(result) = cli_backend(agent, 10)
        .execute(prompt_request("--help", None), false)
        .await
        .unwrap()
    else {
        panic!("expected a completed result");
    };
    assert_eq!(result.content, vec![ContentBlock::text("--help")]);
}

#[tokio::test]
async fn plain_text_output_is_the_reply() {
    let _guard = serial();
    let dir = TempDir::new().unwrap();
    let agent = write_agent(dir.path(), "echo 'just some words'");

    let Execution::Completed(result) = cli_backend(agent, 10)
        .execute(request(None), false)
        .await
        .unwrap()
    else {
        panic!("expected a completed result");
    };
    assert_eq!(result.content, vec![ContentBlock::text("just some words")]);
    assert!(result.usage.is_none());
}

#[tokio::test]
async fn non_zero_exit_reports_stderr() {
    let _guard = serial();
    let dir = TempDir::new().unwrap();
    let agent = write_agent(dir.path(), "echo 'not logged in' >&2\nexit 2");

    let err = cli_backend(agent, 10)
        .execute(request(None), false)
        .await
        .unwrap_err();
    assert!(matches!(err, ProxyError::Backend(_)));
    let message = err.to_string();
    assert!(message.contains("not logged in"), "{message}");
    assert!(message.contains("exit status: 2"), "{message}");
}

#[tokio::test]
async fn missing_binary_is_a_backend_error() {
    let _guard = serial();
    let dir = TempDir::new().unwrap();

    let err = cli_backend(dir.path().join("no-such-agent"), 10)
        .execute(request(None), false)
        .await
        .unwrap_err();
    assert!(matches!(err, ProxyError::Backend(_)));
    assert!(err.to_string().contains("failed to start"));
}

#[tokio::test]
async fn slow_agent_times_out() {
    let _guard = serial();
    let dir = TempDir::new().unwrap();
    let agent = write_agent(dir.path(), "exec sleep 5");

    let started = std::time::Instant::now();
    let err = cli_backend(agent, 1)
        .execute(request(None), false)
        .await
        .unwrap_err();
    assert!(matches!(err, ProxyError::Timeout { secs: 1 }));
    assert!(started.elapsed() < std::time::Duration::from_secs(4));
}

#[tokio::test]
async fn stream_json_lines_become_events() {
    let _guard = serial();
    let dir = TempDir::new().unwrap();
    let agent = write_agent(
        dir.path(),
        r#"echo '{"type":"system","subtype":"init","session_id":"abc"}'
echo '{"type":"stream_event","event":{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hel"}}}'
echo '{"type":"stream_event","event":{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"lo"}}}'
echo '{"type":"stream_event","event":{"type":"message_delta","delta":{"stop_reason":"end_turn"}}}'
echo '{"type":"assistant","message":{"content":[{"type":"text","text":"Hello"}]}}'
echo '{"type":"result","subtype":"success","is_error":false,"result":"Hello","usage":{"input_tokens":3,"output_tokens":2}}'"#,
    );

    let events = collect_stream(
        cli_backend(agent, 10)
            .execute(request(None), true)
            .await
            .unwrap(),
    )
    .await;

    assert!(events.iter().all(Result::is_ok), "{events:?}");
    assert_eq!(texts(&events), "Hello");
    assert!(events
        .iter()
        .any(|e| matches!(e, Ok(BackendEvent::Stop(StopReason::EndTurn)))));
    assert!(events.iter().any(|e| matches!(
        e,
        Ok(BackendEvent::Usage(u)) if u.input_tokens == 3 && u.output_tokens == 2
    )));
}

#[tokio::test]
async fn stream_failure_after_content_ends_with_error() {
    let _guard = serial();
    let dir = TempDir::new().unwrap();
    let agent = write_agent(
        dir.path(),
        r#"echo '{"type":"stream_event","event":{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"partial"}}}'
echo 'rate limited' >&2
exit 3"#,
    );

    let events = collect_stream(
        cli_backend(agent, 10)
            .execute(request(None), true)
            .await
            .unwrap(),
    )
    .await;

    assert_eq!(texts(&events), "partial");
    match events.last() {
        Some(Err(err)) => {
            let message = err.to_string();
            assert!(message.contains("rate limited"), "{message}");
            assert!(message.contains("exit status: 3"), "{message}");
        }
        other => panic!("expected a trailing error, got {other:?}"),
    }
}

#[tokio::test]
async fn stalled_stream_times_out() {
    let _guard = serial();
    let dir = TempDir::new().unwrap();
    let agent = write_agent(
        dir.path(),
        r#"echo '{"type":"stream_event","event":{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"thinking"}}}'
exec sleep 5"#,
    );

    let events = collect_stream(
        cli_backend(agent, 1)
            .execute(request(None), true)
            .await
            .unwrap(),
    )
    .await;

    assert_eq!(texts(&events), "thinking");
    assert!(matches!(
        events.last(),
        Some(Err(ProxyError::Timeout { secs: 1 }))
    ));
}

#[tokio::test]
async fn non_utf8_lines_are_skipped() {
    let _guard = serial();
    let dir = TempDir::new().unwrap();
    let agent = write_agent(
        dir.path(),
        r#"printf '\377\376 progress banner\n'
echo '{"type":"stream_event","event":{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hello"}}}'"#,
    );

    let events = collect_stream(
        cli_backend(agent, 10)
            .execute(request(None), true)
            .await
            .unwrap(),
    )
    .await;

    assert!(events.iter().all(Result::is_ok), "{events:?}");
    assert_eq!(texts(&events), "Hello");
}

/// Zombies count as gone: the kill happened, reaping is up to the runtime.
#[cfg(target_os = "linux")]
fn process_exited(pid: &str) -> bool {
    match fs::read_to_string(format!("/proc/{pid}/stat")) {
        Err(_) => true,
        Ok(stat) => stat
            .rsplit_once(')')
            .and_then(|(_, rest)| rest.split_whitespace().next())
            .is_some_and(|state| state == "Z" || state == "X"),
    }
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn dropping_the_stream_kills_the_agent() {
    let _guard = serial();
    let dir = TempDir::new().unwrap();
    let pid_file = dir.path().join("pid");
    let agent = write_agent(
        dir.path(),
        &format!(
            r#"echo $$ > {}
echo '{{"type":"stream_event","event":{{"type":"content_block_delta","index":0,"delta":{{"type":"text_delta","text":"working"}}}}}}'
exec sleep 30"#,
            pid_file.display()
        ),
    );

    let Execution::Streaming(mut events) = cli_backend(agent, 60)
        .execute(request(None), true)
        .await
        .unwrap()
    else {
        panic!("expected a stream");
    };
    let first = events.next().await.unwrap().unwrap();
    assert_eq!(first, BackendEvent::Text("working".to_string()));

    let pid = fs::read_to_string(&pid_file).unwrap().trim().to_string();
    assert!(!process_exited(&pid), "agent should still be running");

    drop(events);
    let mut exited = false;
    for _ in 0..50 {
        if process_exited(&pid) {
            exited = true;
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }
    assert!(exited, "agent {pid} survived the dropped stream");
}
