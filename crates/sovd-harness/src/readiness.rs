//! Extraction of the gateway's bound address from its log output.
//!
//! Two line grammars are understood:
//!
//! - legacy: `... listening on: 127.0.0.1:8080`, where the protocol is `https` once any
//!   line of the current start attempt mentioned TLS, SSL, https or a certificate;
//! - structured: `protocol="https" listening="0.0.0.0:8443" base="/sovd"` in any order,
//!   as emitted by `tracing`'s fmt layer.

use std::sync::OnceLock;

use regex::Regex;

use crate::types::Readiness;

fn legacy_pattern() -> &'static Regex {
	static RE: OnceLock<Regex> = OnceLock::new();
	RE.get_or_init(|| Regex::new(r"listening on: ([0-9.]+):(\d+)").expect("valid regex"))
}

fn secure_pattern() -> &'static Regex {
	static RE: OnceLock<Regex> = OnceLock::new();
	RE.get_or_init(|| Regex::new(r"(?i)(TLS|SSL|https|certificate)").expect("valid regex"))
}

fn field_pattern(name: &str) -> Regex {
	Regex::new(&format!(r#"\b{}="([^"]*)""#, name)).expect("valid regex")
}

fn protocol_field() -> &'static Regex {
	static RE: OnceLock<Regex> = OnceLock::new();
	RE.get_or_init(|| field_pattern("protocol"))
}

fn listening_field() -> &'static Regex {
	static RE: OnceLock<Regex> = OnceLock::new();
	RE.get_or_init(|| field_pattern("listening"))
}

fn base_field() -> &'static Regex {
	static RE: OnceLock<Regex> = OnceLock::new();
	RE.get_or_init(|| field_pattern("base"))
}

fn ansi_pattern() -> &'static Regex {
	static RE: OnceLock<Regex> = OnceLock::new();
	RE.get_or_init(|| Regex::new(r"\x1b\[[0-9;]*[A-Za-z]").expect("valid regex"))
}

/// Removes terminal color sequences so colored `tracing` output still matches.
pub fn strip_ansi(line: &str) -> std::borrow::Cow<'_, str> {
	ansi_pattern().replace_all(line, "")
}

/// Stateless matcher for readiness lines.
#[derive(Debug, Clone)]
pub struct ReadinessMatcher {
	base_path: String,
}

impl ReadinessMatcher {
	/// `base_path` is appended to addresses found through the legacy grammar, which
	/// carries no path of its own.
	pub fn new(base_path: impl Into<String>) -> Self {
		Self {
			base_path: base_path.into(),
		}
	}

	pub fn base_path(&self) -> &str {
		&self.base_path
	}

	/// Whether the line contains one of the markers that switch the legacy grammar to
	/// `https`.
	pub fn is_secure_marker(&self, line: &str) -> bool {
		secure_pattern().is_match(&strip_ansi(line))
	}

	/// Attempts to extract the bound endpoint from one line.
	///
	/// `secure_seen` is whether this line or an earlier one in the same start attempt
	/// carried a secure marker. It only affects the legacy grammar.
	pub fn match_line(&self, line: &str, secure_seen: bool) -> Option<Readiness> {
		let line = strip_ansi(line);
		if let Some(readiness) = match_structured(&line) {
			return Some(readiness);
		}

		let caps = legacy_pattern().captures(&line)?;
		let host = caps.get(1)?.as_str();
		let port = caps.get(2)?.as_str();
		let secure = secure_seen || secure_pattern().is_match(&line);
		Some(Readiness {
			protocol: if secure { "https" } else { "http" }.to_string(),
			address: format!("{}:{}", host, port),
			base_path: self.base_path.clone(),
		})
	}
}

fn match_structured(line: &str) -> Option<Readiness> {
	let protocol = protocol_field().captures(line)?.get(1)?.as_str();
	let address = listening_field().captures(line)?.get(1)?.as_str();
	let base_path = base_field().captures(line)?.get(1)?.as_str();
	if protocol.is_empty() || address.is_empty() {
		return None;
	}
	Some(Readiness {
		protocol: protocol.to_string(),
		address: address.to_string(),
		base_path: base_path.to_string(),
	})
}

/// Per-attempt scan state: remembers whether a secure marker has been seen.
///
/// Once set the flag stays set until the scan is dropped, so a later plain line cannot
/// downgrade the protocol.
#[derive(Debug)]
pub struct ReadinessScan<'a> {
	matcher: &'a ReadinessMatcher,
	secure_seen: bool,
}

impl<'a> ReadinessScan<'a> {
	pub fn new(matcher: &'a ReadinessMatcher) -> Self {
		Self {
			matcher,
			secure_seen: false,
		}
	}

	pub fn secure_seen(&self) -> bool {
		self.secure_seen
	}

	pub fn feed(&mut self, line: &str) -> Option<Readiness> {
		if self.matcher.is_secure_marker(line) {
			self.secure_seen = true;
		}
		self.matcher.match_line(line, self.secure_seen)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn matcher() -> ReadinessMatcher {
		ReadinessMatcher::new("/opensovd")
	}

	#[test]
	fn legacy_plain_line() {
		let r = matcher()
			.match_line("Server listening on: 127.0.0.1:9001", false)
			.unwrap();
		assert_eq!(r.protocol, "http");
		assert_eq!(r.address, "127.0.0.1:9001");
		assert_eq!(r.base_url(), "http://127.0.0.1:9001/opensovd");
	}

	#[test]
	fn legacy_secure_on_same_line() {
		let r = matcher()
			.match_line("starting 1 worker, TLS enabled, listening on: 0.0.0.0:8443", false)
			.unwrap();
		assert_eq!(r.protocol, "https");
	}

	#[test]
	fn legacy_secure_from_earlier_line() {
		let m = matcher();
		let mut scan = ReadinessScan::new(&m);
		assert!(scan.feed("loading certificate from /tmp/server-cert.pem").is_none());
		assert!(scan.feed("plain http worker started").is_none());
		assert!(scan.secure_seen());
		let r = scan.feed("listening on: 127.0.0.1:4433").unwrap();
		assert_eq!(r.base_url(), "https://127.0.0.1:4433/opensovd");
	}

	#[test]
	fn secure_marker_is_case_insensitive() {
		let m = matcher();
		assert!(m.is_secure_marker("using rustls with ssl config"));
		assert!(m.is_secure_marker("Certificate loaded"));
		assert!(!m.is_secure_marker("plain text"));
	}

	#[test]
	fn structured_line_any_order() {
		let line = r#"2025-01-01T00:00:00Z  INFO gateway: Add server name="SOVD" base="/sovd" protocol="https" mode=tls listening="0.0.0.0:8443""#;
		let r = matcher().match_line(line, false).unwrap();
		assert_eq!(r.protocol, "https");
		assert_eq!(r.address, "0.0.0.0:8443");
		assert_eq!(r.base_path, "/sovd");
	}

	#[test]
	fn structured_ignores_secure_flag() {
		let line = r#"protocol="http" listening="127.0.0.1:8080" base="/sovd""#;
		let r = matcher().match_line(line, true).unwrap();
		assert_eq!(r.base_url(), "http://127.0.0.1:8080/sovd");
	}

	#[test]
	fn structured_with_ansi_colors() {
		let line = "\x1b[3mprotocol\x1b[0m\x1b[2m=\x1b[0m\"https\" \x1b[3mlistening\x1b[0m\x1b[2m=\x1b[0m\"[::1]:8443\" \x1b[3mbase\x1b[0m\x1b[2m=\x1b[0m\"/sovd\"";
		let r = matcher().match_line(line, false).unwrap();
		assert_eq!(r.base_url(), "https://[::1]:8443/sovd");
	}

	#[test]
	fn structured_wins_over_legacy_on_same_line() {
		let line = r#"TLS up, listening on: 127.0.0.1:9001 protocol="http" listening="10.0.0.1:8080" base="/sovd""#;
		let r = matcher().match_line(line, true).unwrap();
		assert_eq!(r.base_url(), "http://10.0.0.1:8080/sovd");
	}

	#[test]
	fn structured_missing_field_is_no_match() {
		assert!(matcher()
			.match_line(r#"protocol="https" base="/sovd""#, false)
			.is_none());
	}

	#[test]
	fn unrelated_and_malformed_lines() {
		let m = matcher();
		assert!(m.match_line("", false).is_none());
		assert!(m.match_line("listening on: nowhere", false).is_none());
		assert!(m.match_line("protocol=\"unterminated listening=\"", false).is_none());
		assert!(m.match_line("\u{fffd}\u{fffd} garbage", true).is_none());
	}
}
