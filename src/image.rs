//! Module load observer.

use std::borrow::Cow;
use std::io::Write;

use crate::engine::ImageLoad;
use crate::error::Result;
use crate::trace::TraceWriter;

/// Record one mapped image. Duplicates are written as reported.
pub fn on_image_loaded<W: Write>(out: &mut TraceWriter<W>, image: &ImageLoad) -> Result<()> {
    out.write_imgload(&single_line(&image.name), image.low, image.high)
}

// Names are written as the engine reports them, except that line breaks
// are escaped: a record must stay on one physical line. Backslashes are
// escaped too, so the escaping can be undone exactly.
fn single_line(name: &str) -> Cow<'_, str> {
    if !name.contains(['\\', '\n', '\r']) {
        return Cow::Borrowed(name);
    }
    let mut escaped = String::with_capacity(name.len() + 2);
    for c in name.chars() {
        match c {
            '\\' => escaped.push_str("\\\\"),
            '\n' => escaped.push_str("\\n"),
            '\r' => escaped.push_str("\\r"),
            c => escaped.push(c),
        }
    }
    Cow::Owned(escaped)
}
