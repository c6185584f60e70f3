#![forbid(unsafe_code)]

/// Compact viewer count for OBS text sources (`999`, `1.2K`, `45K`, `1.5M`).
///
/// Rounds half up to one decimal for `K` below ten thousand and for `M`, to a
/// whole number otherwise. A value that rounds into the next unit is printed
/// in that unit.
pub fn format_viewer_count(n: u64) -> String {
	if n < 1_000 {
		return n.to_string();
	}

	if n < 10_000 {
		let tenths = (n + 50) / 100;
		if tenths < 100 {
			return with_tenths(tenths, 'K');
		}
	}

	let thousands = (n + 500) / 1_000;
	if n < 1_000_000 && thousands < 1_000 {
		return format!("{thousands}K");
	}

	with_tenths((n + 50_000) / 100_000, 'M')
}

fn with_tenths(tenths: u64, unit: char) -> String {
	let (whole, frac) = (tenths / 10, tenths % 10);
	if frac == 0 {
		format!("{whole}{unit}")
	} else {
		format!("{whole}.{frac}{unit}")
	}
}
