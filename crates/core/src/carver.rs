use std::env;
use std::fs;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use globset::{GlobBuilder, GlobMatcher};
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, info, warn, Span};
use walkdir::WalkDir;

use crate::context::RecoveryContext;
use crate::error::{RecoveryError, Result};
use crate::model::ScanResult;

pub const DEFAULT_FILE_TYPES: &[&str] = &["jpg"];
const PHOTOREC_BINARY: &str = "photorec";
const RECUP_PREFIX: &str = "recup_dir";
const FAILURE_TAIL_LINES: usize = 20;
const LINE_CHANNEL_CAPACITY: usize = 256;
const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(200);

static FILES_RECOVERED: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(\d+)\s+files?\s+recovered").expect("summary pattern compiles")
});
static VERSION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"PhotoRec\s+([\d.]+)").expect("version pattern compiles"));

/// A fully built external tool command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl Invocation {
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.display().to_string())
            .chain(self.args.iter().cloned())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanRequest {
    pub target: String,
    pub output_dir: PathBuf,
    pub thorough: bool,
    pub file_types: Vec<String>,
}

impl ScanRequest {
    pub fn new(target: impl Into<String>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            target: target.into(),
            output_dir: output_dir.into(),
            thorough: false,
            file_types: DEFAULT_FILE_TYPES.iter().map(|t| t.to_string()).collect(),
        }
    }
}

/// Seam between the session machine and whatever carves the raw target.
pub trait CarvingEngine {
    fn scan(
        &self,
        request: &ScanRequest,
        ctx: &RecoveryContext,
        progress: &mut dyn FnMut(&str),
    ) -> Result<ScanResult>;
}

#[derive(Debug, Clone)]
pub struct PhotoRec {
    binary: PathBuf,
    span: Span,
}

impl PhotoRec {
    pub fn new(binary: impl Into<PathBuf>, ctx: &RecoveryContext) -> Self {
        Self {
            binary: binary.into(),
            span: ctx.span().clone(),
        }
    }

    /// Uses `explicit` when given, otherwise searches `PATH`.
    pub fn locate(explicit: Option<&Path>, ctx: &RecoveryContext) -> Result<Self> {
        let binary = match explicit {
            Some(path) if path.is_file() => path.to_path_buf(),
            Some(path) => {
                return Err(RecoveryError::ToolNotFound(format!(
                    "PhotoRec not found at {}",
                    path.display()
                )))
            }
            None => find_in_path(PHOTOREC_BINARY).ok_or_else(|| {
                RecoveryError::ToolNotFound(
                    "PhotoRec not found. Install with: brew install testdisk".to_string(),
                )
            })?,
        };
        Ok(Self::new(binary, ctx))
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    pub fn version(&self) -> Result<String> {
        let output = Command::new(&self.binary)
            .arg("/version")
            .stdin(Stdio::null())
            .output()
            .map_err(|err| tool_failure(format!("Failed to check PhotoRec version: {err}")))?;
        if !output.status.success() {
            return Err(RecoveryError::ToolExecutionFailed {
                message: format!(
                    "Failed to check PhotoRec version: exit status {}",
                    output.status
                ),
                exit_code: output.status.code(),
                tail: Vec::new(),
            });
        }
        Ok(parse_version(&String::from_utf8_lossy(&output.stdout)))
    }

    /// Creates `output_dir` and builds the `/d <dir>/recup_dir /cmd <target> <options>`
    /// command line.
    pub fn build_invocation(
        &self,
        target: &str,
        output_dir: &Path,
        thorough: bool,
        file_types: &[String],
    ) -> Result<Invocation> {
        fs::create_dir_all(output_dir).map_err(|err| RecoveryError::io(output_dir, err))?;
        Ok(Invocation {
            program: self.binary.clone(),
            args: vec![
                "/d".to_string(),
                output_dir.join(RECUP_PREFIX).to_string_lossy().to_string(),
                "/cmd".to_string(),
                target.to_string(),
                build_options(thorough, file_types),
            ],
        })
    }

    /// Runs the tool, forwarding every output line to `progress` as it arrives.
    ///
    /// stdout and stderr are drained on separate threads into one channel, so
    /// lines from the two streams interleave in arrival order, not in the
    /// order the tool wrote them. The failure tail inherits that ordering.
    pub fn execute(
        &self,
        request: &ScanRequest,
        ctx: &RecoveryContext,
        progress: &mut dyn FnMut(&str),
    ) -> Result<ScanResult> {
        let invocation = self.build_invocation(
            &request.target,
            &request.output_dir,
            request.thorough,
            &request.file_types,
        )?;
        info!(parent: &self.span, command = %invocation.command_line(), "executing PhotoRec");

        let mut child = Command::new(&invocation.program)
            .args(&invocation.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| tool_failure(format!("Failed to execute PhotoRec: {err}")))?;

        let (tx, rx) = bounded::<String>(LINE_CHANNEL_CAPACITY);
        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(spawn_line_reader(stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_line_reader(stderr, tx.clone()));
        }
        drop(tx);

        let mut output_lines = Vec::new();
        let mut interrupted = false;
        loop {
            if ctx.is_cancelled() {
                interrupted = true;
                break;
            }
            match rx.recv_timeout(CANCEL_POLL_INTERVAL) {
                Ok(line) => {
                    debug!(parent: &self.span, "PhotoRec: {line}");
                    progress(&line);
                    output_lines.push(line);
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        if interrupted {
            warn!(parent: &self.span, "interrupt received; stopping PhotoRec");
            if let Err(err) = child.kill() {
                debug!(parent: &self.span, %err, "PhotoRec already exited");
            }
        }
        let status = child.wait();
        drop(rx);
        for reader in readers {
            let _ = reader.join();
        }

        if interrupted || ctx.is_cancelled() {
            return Err(RecoveryError::Interrupted);
        }

        let status =
            status.map_err(|err| tool_failure(format!("Failed to wait for PhotoRec: {err}")))?;
        if !status.success() {
            let tail = tail_lines(&output_lines, FAILURE_TAIL_LINES);
            return Err(RecoveryError::ToolExecutionFailed {
                message: format!(
                    "PhotoRec failed with code {}\nOutput: {}",
                    status
                        .code()
                        .map(|code| code.to_string())
                        .unwrap_or_else(|| "unknown".to_string()),
                    tail.join("\n")
                ),
                exit_code: status.code(),
                tail,
            });
        }

        parse_results(&request.output_dir, output_lines)
    }
}

impl CarvingEngine for PhotoRec {
    fn scan(
        &self,
        request: &ScanRequest,
        ctx: &RecoveryContext,
        progress: &mut dyn FnMut(&str),
    ) -> Result<ScanResult> {
        self.execute(request, ctx, progress)
    }
}

/// Option order matters: PhotoRec reads the joined string positionally.
pub fn build_options(thorough: bool, file_types: &[String]) -> String {
    let mut options = vec!["fileopt,everything,disable".to_string()];
    if file_types.is_empty() {
        options.extend(DEFAULT_FILE_TYPES.iter().map(|t| format!("fileopt,{t},enable")));
    } else {
        options.extend(file_types.iter().map(|t| format!("fileopt,{t},enable")));
    }
    if thorough {
        options.push("options,paranoid".to_string());
    }
    options.push("search".to_string());
    options.join(",")
}

/// The directory listing is authoritative for the file list; the summary line
/// only raises the reported count.
pub fn parse_results(output_dir: &Path, output_lines: Vec<String>) -> Result<ScanResult> {
    let recup_matcher = file_name_matcher(&format!("{RECUP_PREFIX}.*"))?;
    let jpeg_matcher = file_name_matcher("*.jpg")?;

    let mut recup_dirs = list_entries(output_dir)
        .into_iter()
        .filter(|path| path.is_dir() && matches_file_name(&recup_matcher, path))
        .collect::<Vec<_>>();
    recup_dirs.sort_by_key(|path| (recup_index(path), path.clone()));

    let mut recovered_files = Vec::new();
    for recup_dir in &recup_dirs {
        let mut files = list_entries(recup_dir)
            .into_iter()
            .filter(|path| path.is_file() && matches_file_name(&jpeg_matcher, path))
            .collect::<Vec<_>>();
        files.sort();
        recovered_files.extend(files);
    }

    let reported = output_lines
        .iter()
        .filter_map(|line| FILES_RECOVERED.captures(line))
        .filter_map(|captures| captures[1].parse::<u64>().ok())
        .max()
        .unwrap_or(0);
    let files_recovered = (recovered_files.len() as u64).max(reported);

    Ok(ScanResult {
        output_dir: output_dir.to_path_buf(),
        recup_dirs,
        files_recovered,
        recovered_files,
        output_lines,
    })
}

pub fn parse_version(output: &str) -> String {
    VERSION
        .captures(output)
        .map(|captures| captures[1].to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Splits on `\n` and bare `\r` so redrawn progress lines arrive as they are
/// printed; blank pieces are dropped.
fn spawn_line_reader<R>(reader: R, tx: Sender<String>) -> JoinHandle<()>
where
    R: Read + Send + 'static,
{
    thread::spawn(move || {
        let mut reader = BufReader::new(reader);
        let mut pending = Vec::new();
        loop {
            let consumed = match reader.fill_buf() {
                Ok(chunk) if !chunk.is_empty() => {
                    for &byte in chunk {
                        if byte == b'\n' || byte == b'\r' {
                            if !send_line(&tx, &mut pending) {
                                return;
                            }
                        } else {
                            pending.push(byte);
                        }
                    }
                    chunk.len()
                }
                _ => break,
            };
            reader.consume(consumed);
        }
        send_line(&tx, &mut pending);
    })
}

fn send_line(tx: &Sender<String>, pending: &mut Vec<u8>) -> bool {
    let line = String::from_utf8_lossy(pending).trim_end().to_string();
    pending.clear();
    line.is_empty() || tx.send(line).is_ok()
}

fn list_entries(dir: &Path) -> Vec<PathBuf> {
    WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .follow_links(false)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.into_path())
        .collect()
}

fn file_name_matcher(pattern: &str) -> Result<GlobMatcher> {
    GlobBuilder::new(pattern)
        .case_insensitive(true)
        .literal_separator(true)
        .build()
        .map(|glob| glob.compile_matcher())
        .map_err(|err| tool_failure(format!("invalid result pattern '{pattern}': {err}")))
}

fn matches_file_name(matcher: &GlobMatcher, path: &Path) -> bool {
    path.file_name().is_some_and(|name| matcher.is_match(name))
}

fn recup_index(path: &Path) -> u64 {
    path.extension()
        .and_then(|ext| ext.to_str())
        .and_then(|ext| ext.parse::<u64>().ok())
        .unwrap_or(u64::MAX)
}

fn tail_lines(lines: &[String], count: usize) -> Vec<String> {
    lines[lines.len().saturating_sub(count)..].to_vec()
}

fn tool_failure(message: String) -> RecoveryError {
    RecoveryError::ToolExecutionFailed {
        message,
        exit_code: None,
        tail: Vec::new(),
    }
}

fn find_in_path(name: &str) -> Option<PathBuf> {
    let paths = env::var_os("PATH")?;
    env::split_paths(&paths).find_map(|dir| {
        let candidate = dir.join(name);
        if candidate.is_file() {
            return Some(candidate);
        }
        #[cfg(windows)]
        {
            let exe = dir.join(format!("{name}.exe"));
            if exe.is_file() {
                return Some(exe);
            }
        }
        None
    })
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::{Path, PathBuf};

    use super::{build_options, parse_results, parse_version, tail_lines, PhotoRec};
    use crate::context::RecoveryContext;
    use crate::error::ErrorKind;

    fn photorec() -> PhotoRec {
        PhotoRec::new("/usr/local/bin/photorec", &RecoveryContext::default())
    }

    #[test]
    fn builds_basic_invocation() {
        let dir = tempfile::tempdir().expect("tempdir");
        let out = dir.path().join("scan");
        let invocation = photorec()
            .build_invocation("/dev/rdisk4", &out, false, &["jpg".to_string()])
            .expect("invocation");

        assert!(out.is_dir());
        assert_eq!(invocation.program, PathBuf::from("/usr/local/bin/photorec"));
        assert_eq!(
            invocation.args,
            vec![
                "/d".to_string(),
                out.join("recup_dir").to_string_lossy().to_string(),
                "/cmd".to_string(),
                "/dev/rdisk4".to_string(),
                "fileopt,everything,disable,fileopt,jpg,enable,search".to_string(),
            ]
        );
    }

    #[test]
    fn option_order_is_disable_enable_mode_search() {
        let options = build_options(true, &["jpg".to_string(), "png".to_string()]);
        assert_eq!(
            options,
            "fileopt,everything,disable,fileopt,jpg,enable,fileopt,png,enable,options,paranoid,search"
        );
    }

    #[test]
    fn empty_type_list_falls_back_to_jpeg() {
        assert_eq!(
            build_options(false, &[]),
            "fileopt,everything,disable,fileopt,jpg,enable,search"
        );
    }

    #[test]
    fn directory_listing_is_ground_truth_and_summary_raises_count() {
        let dir = tempfile::tempdir().expect("tempdir");
        let first = dir.path().join("recup_dir.1");
        let second = dir.path().join("recup_dir.2");
        let tenth = dir.path().join("recup_dir.10");
        for recup in [&first, &second, &tenth] {
            fs::create_dir(recup).expect("recup dir");
        }
        fs::write(first.join("f0000002.jpg"), b"x").expect("file");
        fs::write(first.join("f0000001.JPG"), b"x").expect("file");
        fs::write(first.join("report.xml"), b"x").expect("file");
        fs::write(tenth.join("f0009999.jpg"), b"x").expect("file");
        fs::write(second.join("f0000100.jpg"), b"x").expect("file");
        fs::write(dir.path().join("stray.jpg"), b"x").expect("file");

        let lines = vec![
            "PhotoRec 7.2".to_string(),
            "Pass 1 - Reading sector 0/1000".to_string(),
            "7 files recovered".to_string(),
        ];
        let result = parse_results(dir.path(), lines).expect("results");

        assert_eq!(result.recup_dirs, vec![first.clone(), second.clone(), tenth.clone()]);
        assert_eq!(
            result.recovered_files,
            vec![
                first.join("f0000001.JPG"),
                first.join("f0000002.jpg"),
                second.join("f0000100.jpg"),
                tenth.join("f0009999.jpg"),
            ]
        );
        assert_eq!(result.files_recovered, 7);
        assert_eq!(result.output_lines.len(), 3);
    }

    #[test]
    fn summary_never_lowers_directory_count() {
        let dir = tempfile::tempdir().expect("tempdir");
        let recup = dir.path().join("recup_dir.1");
        fs::create_dir(&recup).expect("recup dir");
        for name in ["a.jpg", "b.jpg", "c.jpg"] {
            fs::write(recup.join(name), b"x").expect("file");
        }
        let result =
            parse_results(dir.path(), vec!["1 file recovered".to_string()]).expect("results");
        assert_eq!(result.files_recovered, 3);
    }

    #[test]
    fn extracts_version_or_unknown() {
        assert_eq!(
            parse_version("PhotoRec 7.2, Data Recovery Utility, February 2024"),
            "7.2"
        );
        assert_eq!(parse_version("something else"), "unknown");
    }

    #[test]
    fn tail_keeps_last_lines() {
        let lines = (0..30).map(|i| i.to_string()).collect::<Vec<_>>();
        let tail = tail_lines(&lines, 20);
        assert_eq!(tail.len(), 20);
        assert_eq!(tail[0], "10");
        assert_eq!(tail_lines(&lines[..2], 20).len(), 2);
    }

    #[test]
    fn missing_explicit_binary_is_tool_not_found() {
        let err = PhotoRec::locate(
            Some(Path::new("/definitely/not/here/photorec")),
            &RecoveryContext::default(),
        )
        .expect_err("missing binary");
        assert_eq!(err.kind(), ErrorKind::ToolNotFound);
    }

    #[cfg(unix)]
    mod process {
        use std::fs;
        use std::os::unix::fs::PermissionsExt;
        use std::path::{Path, PathBuf};

        use super::super::{PhotoRec, ScanRequest};
        use crate::context::RecoveryContext;
        use crate::error::{ErrorKind, RecoveryError};

        fn write_script(dir: &Path, body: &str) -> PathBuf {
            let path = dir.join("fake-photorec");
            fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("script");
            let mut permissions = fs::metadata(&path).expect("metadata").permissions();
            permissions.set_mode(0o755);
            fs::set_permissions(&path, permissions).expect("chmod");
            path
        }

        #[test]
        fn streams_lines_and_collects_results() {
            let dir = tempfile::tempdir().expect("tempdir");
            let script = write_script(
                dir.path(),
                r#"mkdir -p "$2.1"
printf 'x' > "$2.1/f0000001.jpg"
printf 'x' > "$2.1/f0000002.jpg"
echo "PhotoRec 7.2"
echo "Pass 1 - Reading sector 10/100 (50%)"
echo "warning on stderr" 1>&2
echo "2 files recovered""#,
            );
            let ctx = RecoveryContext::default();
            let photorec = PhotoRec::locate(Some(script.as_path()), &ctx).expect("locate");
            let out = dir.path().join("scan");

            let mut seen = Vec::new();
            let result = photorec
                .execute(&ScanRequest::new("card.img", &out), &ctx, &mut |line| {
                    seen.push(line.to_string())
                })
                .expect("scan succeeds");

            assert_eq!(result.recovered_files.len(), 2);
            assert_eq!(result.files_recovered, 2);
            assert_eq!(result.recup_dirs, vec![out.join("recup_dir.1")]);
            assert!(seen.iter().any(|line| line.contains("50%")));
            assert!(seen.iter().any(|line| line == "warning on stderr"));
            assert_eq!(seen.len(), result.output_lines.len());
        }

        #[test]
        fn carriage_return_progress_is_streamed_per_update() {
            let dir = tempfile::tempdir().expect("tempdir");
            let script = write_script(
                dir.path(),
                "printf 'Pass 1 10%%\\rPass 1 20%%\\r\\r'\nsleep 1\nprintf 'Pass 1 30%%\\r\\ndone\\n'",
            );
            let ctx = RecoveryContext::default();
            let photorec = PhotoRec::new(&script, &ctx);

            let started = std::time::Instant::now();
            let mut seen = Vec::new();
            let request = ScanRequest::new("card.img", dir.path().join("scan"));
            photorec
                .execute(&request, &ctx, &mut |line| {
                    seen.push((line.to_string(), started.elapsed()))
                })
                .expect("scan succeeds");

            let lines = seen.iter().map(|(line, _)| line.as_str()).collect::<Vec<_>>();
            assert_eq!(lines, vec!["Pass 1 10%", "Pass 1 20%", "Pass 1 30%", "done"]);
            assert!(seen[0].1 < std::time::Duration::from_millis(900));
        }

        #[test]
        fn non_zero_exit_reports_tail() {
            let dir = tempfile::tempdir().expect("tempdir");
            let script = write_script(
                dir.path(),
                "i=0\nwhile [ $i -lt 25 ]; do echo \"line $i\"; i=$((i+1)); done\nexit 3",
            );
            let ctx = RecoveryContext::default();
            let photorec = PhotoRec::new(&script, &ctx);

            let request = ScanRequest::new("card.img", dir.path().join("scan"));
            let err = photorec
                .execute(&request, &ctx, &mut |_| {})
                .expect_err("scan fails");
            assert_eq!(err.kind(), ErrorKind::ToolExecutionFailed);
            match err {
                RecoveryError::ToolExecutionFailed {
                    exit_code, tail, ..
                } => {
                    assert_eq!(exit_code, Some(3));
                    assert_eq!(tail.len(), 20);
                    assert_eq!(tail.last().map(String::as_str), Some("line 24"));
                }
                other => panic!("unexpected error: {other}"),
            }
        }

        #[test]
        fn cancellation_kills_running_tool() {
            let dir = tempfile::tempdir().expect("tempdir");
            let script = write_script(dir.path(), "echo started\nexec sleep 30");
            let ctx = RecoveryContext::default();
            let photorec = PhotoRec::new(&script, &ctx);

            let cancel = ctx.clone();
            let started = std::time::Instant::now();
            let request = ScanRequest::new("card.img", dir.path().join("scan"));
            let err = photorec
                .execute(&request, &ctx, &mut |_| cancel.cancel())
                .expect_err("scan interrupted");
            assert_eq!(err.kind(), ErrorKind::Interrupted);
            assert!(started.elapsed() < std::time::Duration::from_secs(20));
        }

        #[test]
        fn reports_version_from_tool() {
            let dir = tempfile::tempdir().expect("tempdir");
            let script = write_script(dir.path(), "echo 'PhotoRec 7.1, Data Recovery Utility'");
            let photorec = PhotoRec::new(&script, &RecoveryContext::default());
            assert_eq!(photorec.version().expect("version"), "7.1");
        }
    }
}
