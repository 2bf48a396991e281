use rquickjs::Ctx;

mod console;
mod print;
mod require;
mod string;

/// Installs the process-load-time baseline globals, in the same order the
/// teacher installs them: `String.bytesFrom` first (it patches an existing
/// built-in rather than adding a new global), then `print`, `console`,
/// `require`. `console` here is the native module-backed binding; each
/// invocation layers its own capturing `console` on top via
/// `crate::context::InvocationContext::set`.
pub fn setup(ctx: &Ctx<'_>) -> rquickjs::Result<()> {
    string::setup(ctx)?;
    print::setup(ctx)?;
    console::setup(ctx)?;
    require::setup(ctx)?;
    Ok(())
}
