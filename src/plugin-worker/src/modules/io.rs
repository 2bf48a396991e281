//! Bare `print`/`flush`, ported to std. Writes to stderr rather than
//! stdout: stdout is reserved for the worker's line-delimited JSON channel
//! back to the host, and a plugin calling the bare `print()` global must
//! never be able to inject bytes onto that channel.

use std::io::Write as _;

#[rquickjs::module(rename_vars = "camelCase", rename_types = "camelCase")]
#[allow(clippy::module_inception)]
pub mod io {
    use super::*;

    #[rquickjs::function]
    pub fn print(txt: String) {
        let _ = write!(std::io::stderr(), "{txt}");
        flush();
    }

    #[rquickjs::function]
    pub fn flush() {
        let _ = std::io::stderr().flush();
    }
}
