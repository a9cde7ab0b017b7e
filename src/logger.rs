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

//! logging

use std::{io, path::PathBuf};

use fern::colors::{Color, ColoredLevelConfig};

pub fn init(std: log::LevelFilter, file: Option<(log::LevelFilter, PathBuf)>) -> io::Result<()> {
	let colors = ColoredLevelConfig::new()
		.info(Color::Green)
		.warn(Color::Yellow)
		.error(Color::Red)
		.debug(Color::Blue)
		.trace(Color::Magenta);

	let stdout_dispatcher = fern::Dispatch::new()
		.level_for("metrics_harvester", std)
		.level_for("polling", log::LevelFilter::Error)
		.level_for("async_io", log::LevelFilter::Error)
		.format(move |out, message, record| {
			out.finish(format_args!(
				"{} {} {}",
				chrono::Local::now().format("[%H:%M]"),
				colors.color(record.level()),
				message,
			))
		})
		.chain(fern::Dispatch::new().level(std).chain(std::io::stdout()));

	let mut dispatcher = fern::Dispatch::new().chain(stdout_dispatcher);

	if let Some((level, path)) = file {
		let file_dispatcher = fern::Dispatch::new()
			.level(level)
			.level_for("metrics_harvester", level)
			.level_for("polling", log::LevelFilter::Error)
			.level_for("async_io", log::LevelFilter::Error)
			.format(move |out, message, record| {
				out.finish(format_args!(
					"{} [{}][{}] {}",
					chrono::Local::now().format("[%Y-%m-%d][%H:%M:%S]"),
					record.target(),
					record.level(),
					message,
				))
			})
			.chain(fern::log_file(path)?);
		dispatcher = dispatcher.chain(file_dispatcher);
	}

	dispatcher.apply().expect("Could not init logging");
	Ok(())
}
