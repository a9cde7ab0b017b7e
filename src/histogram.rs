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

//! A log-linear quantile sketch. Samples land in bins of two significant
//! decimal digits times a decimal exponent, so relative error is bounded at
//! 5% per bin while the whole sketch stays a few hundred counters. Bins are
//! kept in an ordered map, which makes the serialized form canonical: equal
//! distributions encode to equal bytes.

use std::{cmp::Ordering, collections::BTreeMap};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum RecordError {
	#[error("cannot record non-finite value {0} in histogram")]
	NotFinite(f64),
	#[error("value {0} is out of histogram range")]
	OutOfRange(f64),
}

/// One log-linear bucket: the sample magnitude is `(val / 10) * 10^exp` with
/// `val` in ±[10, 99], the sign carried on `val`. The zero bin is `(0, 0)`
/// and also absorbs magnitudes below `10^-128`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bin {
	val: i8,
	exp: i8,
}

impl Bin {
	const ZERO: Bin = Bin { val: 0, exp: 0 };

	fn midpoint(&self) -> f64 {
		if self.val == 0 {
			return 0.0;
		}
		let magnitude = (self.val.abs() as f64 / 10.0) * 10f64.powi(self.exp as i32);
		let width = 10f64.powi(self.exp as i32) / 10.0;
		let mid = magnitude + width / 2.0;
		if self.val < 0 {
			-mid
		} else {
			mid
		}
	}

	// negatives ascend toward zero, positives away from it
	fn sort_key(&self) -> (i16, i16, i16) {
		match self.val.signum() {
			0 => (0, 0, 0),
			1 => (1, self.exp as i16, self.val as i16),
			_ => (-1, -(self.exp as i16), self.val as i16),
		}
	}
}

impl Ord for Bin {
	fn cmp(&self, other: &Self) -> Ordering {
		self.sort_key().cmp(&other.sort_key())
	}
}

impl PartialOrd for Bin {
	fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
		Some(self.cmp(other))
	}
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Histogram {
	bins: BTreeMap<Bin, u64>,
}

impl Histogram {
	pub fn new() -> Self {
		Self::default()
	}

	/// Insert one sample. Non-finite samples and samples too large for an
	/// `i8` decimal exponent are rejected; magnitudes below `10^-128`
	/// collapse into the zero bin.
	pub fn record(&mut self, value: f64) -> Result<(), RecordError> {
		let bin = Self::bin_of(value)?;
		*self.bins.entry(bin).or_insert(0) += 1;
		Ok(())
	}

	fn bin_of(value: f64) -> Result<Bin, RecordError> {
		if !value.is_finite() {
			return Err(RecordError::NotFinite(value));
		}
		if value == 0.0 {
			return Ok(Bin::ZERO);
		}
		let abs = value.abs();
		let mut exp = abs.log10().floor() as i32;
		// log10 is not exact near powers of ten, renormalize
		let mut scaled = abs / 10f64.powi(exp);
		if scaled >= 10.0 {
			scaled /= 10.0;
			exp += 1;
		} else if scaled < 1.0 {
			scaled *= 10.0;
			exp -= 1;
		}
		if exp < i8::MIN as i32 {
			return Ok(Bin::ZERO);
		}
		if exp > i8::MAX as i32 {
			return Err(RecordError::OutOfRange(value));
		}
		let val = ((scaled * 10.0) as i64).max(10).min(99) as i8;
		Ok(Bin { val: if value < 0.0 { -val } else { val }, exp: exp as i8 })
	}

	/// Total number of recorded samples.
	pub fn count(&self) -> u64 {
		self.bins.values().sum()
	}

	pub fn is_empty(&self) -> bool {
		self.bins.is_empty()
	}

	/// Approximate value at quantile `q` (clamped to `[0, 1]`), the midpoint
	/// of the bin holding the sample of that rank. `None` when empty.
	pub fn quantile(&self, q: f64) -> Option<f64> {
		let total = self.count();
		if total == 0 {
			return None;
		}
		let rank = ((q.max(0.0).min(1.0) * total as f64).ceil() as u64).max(1).min(total);
		let mut seen = 0;
		for (bin, count) in &self.bins {
			seen += count;
			if seen >= rank {
				return Some(bin.midpoint());
			}
		}
		None
	}
}
