use rquickjs::prelude::Rest;
use rquickjs::Coerced;

use super::io::io::print;

#[rquickjs::module(rename_vars = "camelCase", rename_types = "camelCase")]
#[allow(clippy::module_inception)]
pub mod console {
    use super::*;

    /// Process-load-time baseline `console.log`, used only before an
    /// invocation's own console wrapper (see `crate::context`) is
    /// installed, and restored as the literal native binding once that
    /// wrapper is torn down.
    #[rquickjs::function]
    pub fn log(txt: Rest<Coerced<String>>) -> rquickjs::Result<()> {
        let mut txt = txt
            .into_inner()
            .into_iter()
            .map(|mut c| {
                c.0.push(' ');
                c.0
            })
            .collect::<String>();
        txt.pop();
        txt.push('\n');
        print(txt);
        Ok(())
    }
}
