//! Formatting of read-back windows for logs.

use std::fmt::{Display, Write};

/// Formats a `width` x `height` window of `T` values taken from `bytes`,
/// beginning `row_offset` elements in. One string per row.
///
/// Stops early when the bytes run out; a trailing partial element is
/// ignored.
#[must_use]
pub fn format_grid<T>(bytes: &[u8], width: usize, height: usize, row_offset: usize) -> Vec<String>
where
    T: bytemuck::Pod + Display,
{
    let size = std::mem::size_of::<T>();
    if size == 0 || width == 0 {
        return Vec::new();
    }
    let whole = bytes.len() / size * size;
    let values: Vec<T> = bytemuck::pod_collect_to_vec(&bytes[..whole]);
    let Some(window) = values.get(row_offset..) else {
        return Vec::new();
    };

    window
        .chunks(width)
        .take(height)
        .map(|row| {
            let mut line = String::with_capacity(row.len() * 10);
            for v in row {
                let _ = write!(line, "{v:>9.4} ");
            }
            line.truncate(line.trim_end().len());
            line
        })
        .collect()
}

/// Logs the window at `debug` level, one event per row.
pub fn log_grid<T>(label: &str, bytes: &[u8], width: usize, height: usize, row_offset: usize)
where
    T: bytemuck::Pod + Display,
{
    for (row, line) in format_grid::<T>(bytes, width, height, row_offset)
        .iter()
        .enumerate()
    {
        tracing::debug!("{label}[{row}]: {line}");
    }
}
