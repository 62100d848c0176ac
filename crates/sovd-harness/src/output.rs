use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::{broadcast, watch, Mutex};

use crate::error::CapturedLog;
use crate::types::LineResult;

/// Stand-in for "never" when a timeout does not fit in an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// `now + timeout`, saturating to a far-future instant instead of panicking on
/// durations such as `Duration::MAX`.
pub(crate) fn deadline_after(timeout: Duration) -> tokio::time::Instant {
	let now = tokio::time::Instant::now();
	now.checked_add(timeout).unwrap_or_else(|| now + FAR_FUTURE)
}

#[derive(Debug, Default)]
struct Captured {
	lines: Vec<String>,
	open_streams: usize,
}

/// Shared, append-only record of everything a process printed.
///
/// Cloning is cheap; all clones see the same lines.
#[derive(Clone)]
pub struct OutputCapture {
	captured: Arc<watch::Sender<Captured>>,
	log_writer: Option<Arc<Mutex<LogWriter>>>,
	sender: broadcast::Sender<String>,
}

struct LogWriter {
	file: File,
}

impl OutputCapture {
	/// `mirror` is an optional file that receives every captured line as well.
	pub fn new(mirror: Option<&Path>) -> Self {
		let (captured, _) = watch::channel(Captured::default());
		let (sender, _) = broadcast::channel(256);

		let log_writer = mirror.and_then(|path| {
			if let Some(parent) = path.parent() {
				let _ = std::fs::create_dir_all(parent);
			}
			match OpenOptions::new().create(true).append(true).open(path) {
				Ok(file) => Some(Arc::new(Mutex::new(LogWriter { file }))),
				Err(e) => {
					tracing::warn!("could not open output mirror {}: {}", path.display(), e);
					None
				}
			}
		});

		Self {
			captured: Arc::new(captured),
			log_writer,
			sender,
		}
	}

	pub async fn push(&self, line: String) {
		if let Some(writer) = &self.log_writer {
			writer.lock().await.write(&line);
		}
		let _ = self.sender.send(line.clone());
		self.captured.send_modify(|c| c.lines.push(line));
	}

	pub fn snapshot(&self) -> CapturedLog {
		CapturedLog(self.captured.borrow().lines.clone())
	}

	pub fn len(&self) -> usize {
		self.captured.borrow().lines.len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	/// Lines captured after this call.
	pub fn subscribe(&self) -> broadcast::Receiver<String> {
		self.sender.subscribe()
	}

	/// Starts a background task that splits `reader` into lines and records them.
	pub fn attach<R>(&self, reader: R) -> tokio::task::JoinHandle<()>
	where
		R: AsyncRead + Unpin + Send + 'static,
	{
		self.captured.send_modify(|c| c.open_streams += 1);
		let out = self.clone();
		tokio::spawn(async move {
			pipe_lines(reader, &out).await;
			out.captured.send_modify(|c| c.open_streams -= 1);
		})
	}

	/// A cursor over this capture starting at the first line.
	pub fn drain(&self) -> OutputDrain {
		OutputDrain {
			capture: self.clone(),
			changes: self.captured.subscribe(),
			cursor: 0,
		}
	}
}

impl LogWriter {
	fn write(&mut self, line: &str) {
		let _ = writeln!(self.file, "{}", line);
	}
}

/// Reads captured lines in order without removing them from the capture.
pub struct OutputDrain {
	capture: OutputCapture,
	changes: watch::Receiver<Captured>,
	cursor: usize,
}

impl OutputDrain {
	pub fn capture(&self) -> &OutputCapture {
		&self.capture
	}

	/// Returns the next unread line, waiting at most `timeout` for one to arrive.
	pub async fn read_next_line(&mut self, timeout: Duration) -> LineResult {
		let deadline = deadline_after(timeout);
		loop {
			{
				let captured = self.changes.borrow_and_update();
				if let Some(line) = captured.lines.get(self.cursor) {
					self.cursor += 1;
					return LineResult::Line(line.clone());
				}
				if captured.open_streams == 0 {
					return LineResult::EndOfStream;
				}
			}

			match tokio::time::timeout_at(deadline, self.changes.changed()).await {
				Ok(Ok(())) => continue,
				// The capture owns the sender, so this cannot close while we hold it.
				Ok(Err(_)) => return LineResult::EndOfStream,
				Err(_) => return LineResult::Timeout,
			}
		}
	}
}

async fn pipe_lines<R: AsyncRead + Unpin>(reader: R, output: &OutputCapture) {
	let mut reader = BufReader::new(reader);
	let mut buf = Vec::with_capacity(256);
	loop {
		buf.clear();
		match reader.read_until(b'\n', &mut buf).await {
			Ok(0) => break,
			Ok(_) => {
				while matches!(buf.last(), Some(b'\n' | b'\r')) {
					buf.pop();
				}
				output.push(String::from_utf8_lossy(&buf).into_owned()).await;
			}
			Err(e) => {
				tracing::debug!("output pipe closed with error: {}", e);
				break;
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn lines_are_split_and_decoded_lossily() {
		let capture = OutputCapture::new(None);
		let data: &[u8] = b"first\r\nsec\xffond\nno newline";
		capture.attach(data).await.unwrap();

		let log = capture.snapshot();
		assert_eq!(log.lines().len(), 3);
		assert_eq!(log.lines()[0], "first");
		assert_eq!(log.lines()[1], "sec\u{fffd}ond");
		assert_eq!(log.lines()[2], "no newline");
	}

	#[tokio::test]
	async fn drain_reports_end_of_stream() {
		let capture = OutputCapture::new(None);
		let mut drain = capture.drain();
		capture.attach(&b"only\n"[..]).await.unwrap();

		let t = Duration::from_millis(100);
		assert_eq!(drain.read_next_line(t).await, LineResult::Line("only".into()));
		assert_eq!(drain.read_next_line(t).await, LineResult::EndOfStream);
		// Reading does not consume the capture.
		assert_eq!(capture.len(), 1);
	}

	#[tokio::test]
	async fn drain_times_out_while_stream_open() {
		let capture = OutputCapture::new(None);
		let (_writer, reader) = tokio::io::duplex(64);
		let _pipe = capture.attach(reader);
		let mut drain = capture.drain();

		let started = std::time::Instant::now();
		let result = drain.read_next_line(Duration::from_millis(100)).await;
		assert_eq!(result, LineResult::Timeout);
		assert!(started.elapsed() >= Duration::from_millis(90));
	}

	#[tokio::test]
	async fn unbounded_read_waits_for_the_next_line() {
		let capture = OutputCapture::new(None);
		let (mut writer, reader) = tokio::io::duplex(64);
		let _pipe = capture.attach(reader);
		let mut drain = capture.drain();

		let write = tokio::spawn(async move {
			use tokio::io::AsyncWriteExt;
			tokio::time::sleep(Duration::from_millis(50)).await;
			writer.write_all(b"late\n").await.unwrap();
			writer
		});
		let result = drain.read_next_line(Duration::MAX).await;
		assert_eq!(result, LineResult::Line("late".into()));
		drop(write.await.unwrap());
	}

	#[test]
	fn oversized_deadline_saturates() {
		let deadline = deadline_after(Duration::MAX);
		assert!(deadline > tokio::time::Instant::now() + Duration::from_secs(86400));
	}

	#[tokio::test]
	async fn mirror_file_receives_lines() {
		let dir = std::env::temp_dir().join(format!("sovd-harness-mirror-{}", std::process::id()));
		let path = dir.join("gateway.log");
		let capture = OutputCapture::new(Some(&path));
		capture.attach(&b"a\nb\n"[..]).await.unwrap();

		let content = std::fs::read_to_string(&path).unwrap();
		assert_eq!(content, "a\nb\n");
		let _ = std::fs::remove_dir_all(&dir);
	}
}
