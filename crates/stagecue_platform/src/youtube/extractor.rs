#![forbid(unsafe_code)]

//! Concurrent-viewer extraction from Innertube `get_info` payloads.
//!
//! The payload is treated as opaque JSON; each strategy looks in one place and
//! either yields a count or records why it could not.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;
use serde_json::Value;

/// Upper bound for a plausible concurrent-viewer count.
pub const MAX_VIEWER_COUNT: u64 = 10_000_000;

/// Finite and within `[0, MAX_VIEWER_COUNT]`.
pub fn is_valid_viewer_count(n: f64) -> bool {
	n.is_finite() && (0.0..=MAX_VIEWER_COUNT as f64).contains(&n)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionStrategy {
	ViewText,
	VideoDetails,
	BasicInfo,
}

impl ExtractionStrategy {
	pub const DEFAULT_ORDER: [ExtractionStrategy; 3] = [Self::ViewText, Self::VideoDetails, Self::BasicInfo];

	pub fn as_str(&self) -> &'static str {
		match self {
			Self::ViewText => "view_text",
			Self::VideoDetails => "video_details",
			Self::BasicInfo => "basic_info",
		}
	}
}

impl fmt::Display for ExtractionStrategy {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractOptions {
	pub strategies: Vec<ExtractionStrategy>,
}

impl Default for ExtractOptions {
	fn default() -> Self {
		Self {
			strategies: ExtractionStrategy::DEFAULT_ORDER.to_vec(),
		}
	}
}

/// What a single strategy saw.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StrategyRecord {
	#[serde(skip_serializing_if = "Option::is_none")]
	pub value: Option<Value>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub count: Option<u64>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ExtractionMetadata {
	/// Strategies tried, in order.
	pub attempted: Vec<ExtractionStrategy>,
	pub raw_data: BTreeMap<ExtractionStrategy, StrategyRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExtractionResult {
	pub count: u64,
	pub strategy: Option<ExtractionStrategy>,
	pub success: bool,
	pub metadata: ExtractionMetadata,
}

const NUM: &str = r"(\d[\d,.' \x{a0}]*\d|\d)";

static VIEW_TEXT_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
	[
		r"watching\s+now",
		r"watching",
		r"currently\s+watching",
		r"viewers?\s+watching",
		r"people\s+watching",
	]
	.iter()
	.map(|suffix| Regex::new(&format!(r"(?i){NUM}\s*{suffix}")).expect("view text pattern is valid"))
	.collect()
});

/// Run the strategy chain; the first valid count wins.
pub fn extract_concurrent_viewers(video_info: &Value, opts: &ExtractOptions) -> ExtractionResult {
	let mut metadata = ExtractionMetadata::default();

	for &strategy in &opts.strategies {
		metadata.attempted.push(strategy);
		let outcome = match strategy {
			ExtractionStrategy::ViewText => from_view_text(video_info),
			ExtractionStrategy::VideoDetails => from_video_details(video_info),
			ExtractionStrategy::BasicInfo => from_basic_info(video_info),
		};

		match outcome {
			Ok((count, value)) => {
				metadata.raw_data.insert(
					strategy,
					StrategyRecord {
						value: Some(value),
						count: Some(count),
						error: None,
					},
				);
				return ExtractionResult {
					count,
					strategy: Some(strategy),
					success: true,
					metadata,
				};
			}
			Err(error) => {
				metadata.raw_data.insert(
					strategy,
					StrategyRecord {
						error: Some(error),
						..StrategyRecord::default()
					},
				);
			}
		}
	}

	ExtractionResult {
		count: 0,
		strategy: None,
		success: false,
		metadata,
	}
}

type StrategyOutcome = Result<(u64, Value), String>;

fn from_view_text(info: &Value) -> StrategyOutcome {
	let node = info
		.pointer("/primary_info/view_count/view_count/text")
		.ok_or_else(|| "primary_info.view_count.view_count.text missing".to_string())?;
	let text = node.as_str().ok_or_else(|| "view count text is not a string".to_string())?;

	for re in VIEW_TEXT_PATTERNS.iter() {
		if let Some(caps) = re.captures(text) {
			let digits: String = caps[1].chars().filter(char::is_ascii_digit).collect();
			let n: u64 = digits.parse().map_err(|e| format!("unparseable count {:?}: {e}", &caps[1]))?;
			return accept(n as f64, node.clone());
		}
	}
	Err(format!("no viewer pattern matched {text:?}"))
}

fn from_video_details(info: &Value) -> StrategyOutcome {
	let details = info
		.get("video_details")
		.ok_or_else(|| "video_details missing".to_string())?;

	let mut last_err = "video_details has no viewer count".to_string();
	for key in ["viewer_count", "concurrent_viewers"] {
		let Some(v) = details.get(key) else {
			continue;
		};
		match numeric(v) {
			Some(n) => match accept(n, v.clone()) {
				Ok(ok) => return Ok(ok),
				Err(e) => last_err = format!("{key}: {e}"),
			},
			None => last_err = format!("{key} is not numeric: {v}"),
		}
	}
	Err(last_err)
}

fn from_basic_info(info: &Value) -> StrategyOutcome {
	let basic = info.get("basic_info").ok_or_else(|| "basic_info missing".to_string())?;
	if basic.get("is_live").and_then(Value::as_bool) != Some(true) {
		return Err("basic_info.is_live is not true".to_string());
	}
	let v = basic
		.get("view_count")
		.ok_or_else(|| "basic_info.view_count missing".to_string())?;
	let n = numeric(v).ok_or_else(|| format!("basic_info.view_count is not numeric: {v}"))?;
	accept(n, v.clone())
}

fn numeric(v: &Value) -> Option<f64> {
	match v {
		Value::Number(n) => n.as_f64(),
		Value::String(s) => {
			let s = s.trim();
			if s.is_empty() {
				None
			} else {
				s.parse::<f64>().ok()
			}
		}
		_ => None,
	}
}

fn accept(n: f64, raw: Value) -> StrategyOutcome {
	if !is_valid_viewer_count(n) {
		return Err(format!("viewer count out of range: {n}"));
	}
	if n.fract() != 0.0 {
		return Err(format!("viewer count is not an integer: {n}"));
	}
	Ok((n as u64, raw))
}
