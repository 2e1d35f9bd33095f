//! Writing-system checks for cleaned names.
//!
//! Certificate fonts are picked for Latin text. Names in other scripts are
//! reported before rendering and, when configured, spelled out in ASCII.

use std::borrow::Cow;

use deunicode::deunicode;
use unicode_script::{Script, UnicodeScript};

/// Scripts a Latin certificate font can draw: letters, digits, punctuation
/// and combining marks.
fn drawable_in_latin_font(script: Script) -> bool {
    matches!(script, Script::Latin | Script::Common | Script::Inherited)
}

/// First script in `name` that a Latin-only font cannot draw.
pub fn foreign_script(name: &str) -> Option<Script> {
    name.chars()
        .map(|c| c.script())
        .find(|script| !drawable_in_latin_font(*script))
}

/// ASCII spelling of a name written in a foreign script.
/// Names a Latin font can already draw come back borrowed and unchanged.
pub fn latinize(name: &str) -> Cow<'_, str> {
    if foreign_script(name).is_none() {
        return Cow::Borrowed(name);
    }
    let spelled = deunicode(name);
    Cow::Owned(spelled.split_whitespace().collect::<Vec<_>>().join(" "))
}
