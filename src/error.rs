// Copyright 2024-2026 The metrics-harvester authors.
// This file is part of metrics-harvester.

// metrics-harvester is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// metrics-harvester is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
// You should have received a copy of the GNU General Public License
// along with metrics-harvester.  If not, see <http://www.gnu.org/licenses/>.

use std::io;

use itertools::Itertools;
use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Harvester Error Enum
#[derive(Debug, Error)]
pub enum Error {
	// Rust std io error
	#[error(transparent)]
	Io(#[from] io::Error),

	// encoding error
	#[error("encode: {0}")]
	Encode(#[from] rmp_serde::encode::Error),
	#[error("decode: {0}")]
	Decode(#[from] rmp_serde::decode::Error),

	// object store error
	#[error("object `{0}` does not exist")]
	NotFound(String),

	// query server errors
	#[error("failed to query server API: {0}")]
	Api(String),
	#[error("could not determine server retention duration: {0}")]
	Retention(String),
	#[error("returned result of type `{0}` cannot be cast to matrix")]
	UnexpectedShape(&'static str),

	// cycle interrupted before the work finished
	#[error("harvest interrupted")]
	Interrupted,

	/// Compound error collected from the fan-out workers of one cycle.
	#[error("{}", .0.iter().join("; "))]
	Aggregate(Vec<Error>),
}

impl Error {
	/// The server does not expose gateway timeouts programmatically, only as
	/// a message suffix.
	pub fn is_gateway_timeout(&self) -> bool {
		matches!(self, Error::Api(message) if message.ends_with("504"))
	}

	/// Collapse the errors of one cycle into a single error, `None` when the
	/// cycle was clean.
	pub fn aggregate(mut errors: Vec<Error>) -> Option<Error> {
		match errors.len() {
			0 => None,
			1 => Some(errors.remove(0)),
			_ => Some(Error::Aggregate(errors)),
		}
	}
}

impl From<tokio::sync::AcquireError> for Error {
	fn from(_: tokio::sync::AcquireError) -> Self {
		Self::Interrupted
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn gateway_timeouts_are_recognized_by_suffix() {
		assert!(Error::Api("server_error: server error: 504".into()).is_gateway_timeout());
		assert!(!Error::Api("server_error: server error: 503".into()).is_gateway_timeout());
		assert!(!Error::Interrupted.is_gateway_timeout());
	}

	#[test]
	fn aggregate_collapses_to_the_smallest_shape() {
		assert!(Error::aggregate(vec![]).is_none());

		let one = Error::aggregate(vec![Error::Api("boom".into())]).unwrap();
		assert!(matches!(one, Error::Api(_)));

		let many = Error::aggregate(vec![Error::Api("a 504".into()), Error::Interrupted]).unwrap();
		assert_eq!(many.to_string(), "failed to query server API: a 504; harvest interrupted");
	}
}
