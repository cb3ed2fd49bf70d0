
#[macro_use] extern crate serde;

#[macro_use]
mod macros;
mod msgs;
pub use crate::msgs::*;

use std::borrow::Cow;
use std::fmt;

use serde::de::DeserializeOwned;
use serde::ser::{Serialize, SerializeMap, Serializer};


/// The "target" field used for structured logging.
pub const SLOG_TARGET: &str = "mwallet-slog";

const LOGID_FIELD: &str = "slog_id";
const DATA_FIELD: &str = "slog_data";

/// Trait implemented by all our structured log messages.
pub trait LogMsg: Sized + Send + fmt::Debug + Serialize + DeserializeOwned + 'static {
	const LOGID: &'static str;
	const LEVEL: log::Level;
	const MSG: &'static str;
}

/// Exposes a log message as the key-values of a [log::Record].
struct MsgSource<'a, T>(&'a T);

impl<'a, T: LogMsg> log::kv::Source for MsgSource<'a, T> {
	fn visit<'kvs>(
		&'kvs self,
		visitor: &mut dyn log::kv::VisitSource<'kvs>,
	) -> Result<(), log::kv::Error> {
		visitor.visit_pair(LOGID_FIELD.into(), T::LOGID.into())?;
		visitor.visit_pair(DATA_FIELD.into(), log::kv::Value::from_serde(self.0))?;
		Ok(())
	}

	fn count(&self) -> usize {
		2
	}
}

/// Emit a structured log message. Use the [slog] macro instead.
pub fn log<T: LogMsg>(msg: &T, module: &str, file: &str, line: u32) {
	let source = MsgSource(msg);
	log::logger().log(&log::Record::builder()
		.args(format_args!("{}", T::MSG))
		.level(T::LEVEL)
		.target(SLOG_TARGET)
		.module_path(Some(module))
		.file(Some(file))
		.line(Some(line))
		.key_values(&source)
		.build());
}

/// A wrapper around a [log::Record] that implements [serde::Serialize].
pub struct RecordSerializeWrapper<'a>(pub &'a log::Record<'a>);

impl<'a> Serialize for RecordSerializeWrapper<'a> {
	fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
		let mut m = s.serialize_map(None)?;
		m.serialize_entry("message", &self.0.args().to_string())?;
		m.serialize_entry("level", self.0.level().as_str())?;
		m.serialize_entry("target", self.0.target())?;
		if let Some(file) = self.0.file() {
			m.serialize_entry("file", file)?;
		}
		if let Some(line) = self.0.line() {
			m.serialize_entry("line", &line)?;
		}
		let kv = self.0.key_values();
		if let Some(id) = kv.get(LOGID_FIELD.into()) {
			m.serialize_entry("slog_id", &id)?;
		}
		if let Some(data) = kv.get(DATA_FIELD.into()) {
			m.serialize_entry("slog_data", &data)?;
		}
		m.end()
	}
}

#[derive(Debug)]
pub enum RecordParseError {
	WrongType,
	Json(serde_json::Error),
}

pub fn parse_record(record: &str) -> Result<ParsedRecord<'_>, RecordParseError> {
	Ok(serde_json::from_str(record).map_err(RecordParseError::Json)?)
}

#[derive(Debug, Deserialize)]
pub struct ParsedRecord<'a> {
	#[serde(borrow)]
	pub message: Cow<'a, str>,
	pub level: Cow<'a, str>,
	pub target: Option<&'a str>,
	pub file: Option<&'a str>,
	pub line: Option<u32>,
	// structured stuff
	pub slog_id: Option<&'a str>,
	pub slog_data: Option<&'a serde_json::value::RawValue>,
}

impl ParsedRecord<'_> {
	/// Whether this is a structured log message
	pub fn is_slog(&self) -> bool {
		self.slog_id.is_some()
	}

	/// Check whether this log message if of the given structure log type.
	pub fn is<T: LogMsg>(&self) -> bool {
		self.slog_id == Some(T::LOGID)
	}

	/// Try to parse the log message into the given structured log type.
	pub fn try_as<T: LogMsg>(&self) -> Result<T, RecordParseError> {
		if !self.is::<T>() {
			return Err(RecordParseError::WrongType);
		}

		let json = self.slog_data.map(|v| v.get()).unwrap_or("{}");
		Ok(serde_json::from_str(json).map_err(RecordParseError::Json)?)
	}
}


#[cfg(test)]
mod test {
	use super::*;

	use std::sync::Mutex;

	#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
	pub struct TestLog {
		nb: usize,
		name: String,
	}
	impl_slog!(TestLog, Info, "test log message");

	#[test]
	fn log_msg_trait() {
		assert_eq!(TestLog::LOGID, "TestLog");
		assert_eq!(TestLog::LEVEL, log::Level::Info);
		assert_eq!(TestLog::MSG, "test log message");
		assert_eq!(TipUpdated::LOGID, "TipUpdated");
	}

	struct CaptureLogger(Mutex<Vec<String>>);

	impl log::Log for CaptureLogger {
		fn enabled(&self, _: &log::Metadata) -> bool { true }
		fn log(&self, record: &log::Record) {
			let json = serde_json::to_string(&RecordSerializeWrapper(record)).unwrap();
			self.0.lock().unwrap().push(json);
		}
		fn flush(&self) {}
	}

	#[test]
	fn record_roundtrip() {
		let logger = CaptureLogger(Mutex::new(Vec::new()));
		let msg = TestLog { nb: 42, name: "test".into() };
		let source = MsgSource(&msg);
		log::Log::log(&logger, &log::Record::builder()
			.args(format_args!("{}", TestLog::MSG))
			.level(TestLog::LEVEL)
			.target(SLOG_TARGET)
			.key_values(&source)
			.build());

		let records = logger.0.lock().unwrap();
		let parsed = parse_record(&records[0]).unwrap();
		assert!(parsed.is_slog());
		assert!(parsed.is::<TestLog>());
		assert!(!parsed.is::<TipUpdated>());
		assert_eq!(parsed.message, "test log message");
		assert_eq!(parsed.level, "INFO");
		assert_eq!(parsed.try_as::<TestLog>().unwrap(), msg);
		assert!(matches!(parsed.try_as::<ReorgDetected>(), Err(RecordParseError::WrongType)));
	}

	#[test]
	fn parse_plain_record() {
		let json = serde_json::to_string(&serde_json::json!({
			"message": "test",
			"level": "INFO",
			"file": "test.rs",
			"line": 35,
		})).unwrap();
		let parsed = parse_record(&json).unwrap();
		assert!(!parsed.is_slog());
		assert!(!parsed.is::<TestLog>());
	}
}
