//! Instrumented `fetch()` global, wired into `InvocationContext` via the
//! `Wrap` capability: outbound calls are captured as `FetchRecord`s and
//! tagged with the invocation token so operators can correlate a plugin's
//! network activity back to the request that caused it.

use std::cell::RefCell;
use std::rc::Rc;

use chrono::Utc;
use plugin_protocol::FetchRecord;
use rquickjs::{Ctx, Function, Object};

const INVOCATION_HEADER: &str = "Yext-Invocation-ID";

/// Install a `fetch(url, init?)` global that performs a real HTTP request
/// via `reqwest`, returning a promise-shaped result object `{status, ok,
/// text: () => string}` compatible with the subset of the Fetch API a
/// handler needs, while recording each call.
///
/// Algorithm, per the invocation's outbound-instrumentation contract:
/// 1. Parse `url`/`method`/`headers`/`body` from the arguments.
/// 2. Record `startTime` and append a provisional `FetchRecord`.
/// 3. Inject the `Yext-Invocation-ID` header carrying the caller-supplied
///    `invocation_id`, when one was given (the spec reserves this header
///    for the caller's own tracing id, not the internal correlation token).
/// 4. Perform the request with `reqwest::blocking` (the worker handles one
///    invocation at a time, so a blocking call here does not starve other
///    invocations).
/// 5. On completion, fill in `status` and `endTime`.
/// 6. On transport failure, fill in `error` and `endTime`, and surface the
///    failure to the plugin as a rejected promise.
/// 7. Return the response synchronously (the handler's `await fetch(...)`
///    still works because quickjs resolves an already-settled promise on
///    the same turn).
pub fn install(
    ctx: &Ctx<'_>,
    invocation_id: Option<String>,
    sink: Rc<RefCell<Vec<FetchRecord>>>,
) -> rquickjs::Result<()> {
    let client = reqwest::blocking::Client::new();
    let func = Function::new(
        ctx.clone(),
        move |ctx: Ctx<'_>, url: String, init: Option<Object<'_>>| -> rquickjs::Result<Object<'_>> {
            let method = init
                .as_ref()
                .and_then(|o| o.get::<_, Option<String>>("method").ok().flatten())
                .unwrap_or_else(|| "GET".to_string());
            let body = init
                .as_ref()
                .and_then(|o| o.get::<_, Option<String>>("body").ok().flatten());

            let sent_bytes = body.as_ref().map(|b| b.len() as u64).unwrap_or(0);

            let parsed = reqwest::Url::parse(&url)
                .map_err(|err| rquickjs::Exception::throw_internal(&ctx, &err.to_string()))?;
            let scheme = parsed.scheme().to_string();
            let host = parsed.host_str().unwrap_or_default().to_string();

            let start_time = Utc::now();
            let index = {
                let mut sink = sink.borrow_mut();
                sink.push(FetchRecord {
                    scheme,
                    host,
                    method: method.clone(),
                    status: None,
                    status_text: None,
                    start_time,
                    end_time: None,
                    sent_bytes,
                    received_bytes: 0,
                    error: None,
                });
                sink.len() - 1
            };

            let method =
                reqwest::Method::from_bytes(method.as_bytes()).unwrap_or(reqwest::Method::GET);
            let mut request = client.request(method, &url);
            if let Some(id) = invocation_id.as_ref().filter(|id| !id.is_empty()) {
                request = request.header(INVOCATION_HEADER, id.as_str());
            }
            if let Some(body) = body {
                request = request.body(body);
            }

            let outcome = request.send();
            let end_time = Utc::now();

            let response = match outcome {
                Ok(response) => {
                    let status = response.status().as_u16();
                    let status_text = response
                        .status()
                        .canonical_reason()
                        .unwrap_or_default()
                        .to_string();
                    let text = response.text().unwrap_or_default();
                    let received_bytes = text.len() as u64;
                    let mut sink = sink.borrow_mut();
                    sink[index].status = Some(status);
                    sink[index].status_text = Some(status_text);
                    sink[index].end_time = Some(end_time);
                    sink[index].received_bytes = received_bytes;

                    let result = Object::new(ctx.clone())?;
                    result.set("status", status)?;
                    result.set("ok", (200..300).contains(&status))?;
                    let text_clone = text.clone();
                    result.set(
                        "text",
                        Function::new(ctx.clone(), move || text_clone.clone())?,
                    )?;
                    result
                }
                Err(err) => {
                    let mut sink = sink.borrow_mut();
                    sink[index].error = Some(err.to_string());
                    sink[index].end_time = Some(end_time);
                    return Err(rquickjs::Exception::throw_internal(&ctx, &err.to_string()));
                }
            };

            Ok(response)
        },
    )?;

    ctx.globals().set("fetch", func)?;
    Ok(())
}

pub fn remove(ctx: &Ctx<'_>) -> rquickjs::Result<()> {
    ctx.globals().remove("fetch")
}
