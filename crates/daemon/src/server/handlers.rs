//! The request handler.
//!
//! Every action arrives at the same path, as query parameters on `GET` or
//! as a form body on `POST`. Mutations answer with a `303` back to the
//! listing so a browser refresh never repeats them.

use std::net::SocketAddr;

use axum::body::Body;
use axum::extract::{ConnectInfo, FromRequest, Multipart, Request, State};
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Redirect, Response};
use axum::Json;
use bytes::Bytes;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};
use url::form_urlencoded;
use wfm_protocol::form::{FIELD_DIR, FIELD_HIGHLIGHT, FIELD_SORT, FIELD_UPLOAD_FILE};
use wfm_protocol::{Action, FormFields, FormRequest, ListTarget};

use super::error::{challenge, HttpError};
use super::AppState;
use crate::auth::{BanList, Caller};
use crate::files::content::STREAM_CHUNK_SIZE;
use crate::files::guard::{anchor_path, parent_path};
use crate::files::{ContentPlan, FileError, FileTarget, Listing, ServeMode, StreamPlan};

/// Room for the fields around the text of a save request.
const FORM_OVERHEAD: usize = 64 * 1024;

/// Chunks buffered between the multipart reader and the disk writer.
const UPLOAD_QUEUE: usize = 8;

/// Listing response.
#[derive(Debug, Serialize)]
pub struct ListingPage {
    #[serde(flatten)]
    pub listing: Listing,
    pub user: String,
    pub writable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub highlight: Option<String>,
}

/// Entry point for every request under the prefix.
pub async fn handle(State(state): State<AppState>, request: Request) -> Response {
    let mut response = match dispatch(&state, request).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    };
    response
        .headers_mut()
        .entry(header::CACHE_CONTROL)
        .or_insert_with(|| state.cache_control.clone());
    response
}

async fn dispatch(state: &AppState, request: Request) -> Result<Response, HttpError> {
    let addr = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0);
    let authorization = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    let caller = state.auth.authenticate(authorization, addr)?;

    let mut fields = FormFields::parse(request.uri().query().unwrap_or_default().as_bytes());

    if request.method() == Method::POST {
        if is_multipart(request.headers()) {
            if let Some(target) = read_multipart(state, &caller, &mut fields, request).await? {
                return Ok(listing_redirect(
                    state,
                    &target.dir(),
                    fields.value(FIELD_SORT),
                    Some(target.name()),
                ));
            }
        } else {
            let limit = form_limit(state);
            let body = axum::body::to_bytes(request.into_body(), limit)
                .await
                .map_err(|e| HttpError::BadRequest(format!("unreadable form body: {e}")))?;
            fields.extend(FormFields::parse(&body));
        }
    }

    let form = FormRequest::from_fields(&fields);
    debug!(user = %caller, action = form.action.name(), fields = ?fields.redacted(), "request");
    perform(state, caller, form).await
}

async fn perform(state: &AppState, caller: Caller, form: FormRequest) -> Result<Response, HttpError> {
    let FormRequest { dir, sort, action } = form;
    let files = state.files.clone();

    match action {
        Action::List { target, highlight } => {
            let dir = match target {
                ListTarget::Current => anchor_path(&dir),
                ListTarget::Home => "/".to_string(),
                ListTarget::Parent => parent_path(&anchor_path(&dir)),
            };
            let listing = blocking(move || files.list(&dir, &sort)).await?;
            Ok(Json(ListingPage {
                listing,
                writable: caller.can_write(),
                user: caller.name,
                highlight,
            })
            .into_response())
        }
        Action::Display { path } => {
            let plan = blocking(move || files.plan_content(&path, ServeMode::Inline)).await?;
            respond_content(plan).await
        }
        Action::Download { path } => {
            let plan = blocking(move || files.plan_content(&path, ServeMode::Download)).await?;
            respond_content(plan).await
        }
        Action::Edit { path } => {
            let document = blocking(move || files.read_text(&path)).await?;
            Ok(Json(document).into_response())
        }
        Action::Save { path, text } => {
            let target = blocking(move || files.save_text(&caller, &path, &text)).await?;
            Ok(listing_redirect(state, &target.dir(), &sort, Some(target.name())))
        }
        Action::Upload => Err(HttpError::BadRequest(format!(
            "upload needs a multipart {FIELD_UPLOAD_FILE} field"
        ))),
        Action::Mkdir { name } => {
            let at = dir.clone();
            let target = blocking(move || files.mkdir(&caller, &at, &name)).await?;
            Ok(listing_redirect(state, &dir, &sort, Some(target.name())))
        }
        Action::Mkfile { name } => {
            let at = dir.clone();
            let target = blocking(move || files.mkfile(&caller, &at, &name)).await?;
            Ok(listing_redirect(state, &dir, &sort, Some(target.name())))
        }
        Action::Mkurl { name, url } => {
            let at = dir.clone();
            let target = blocking(move || files.mkurl(&caller, &at, &name, &url)).await?;
            Ok(listing_redirect(state, &dir, &sort, Some(target.name())))
        }
        Action::Rename { name, new_name } => {
            let at = dir.clone();
            let target = blocking(move || files.rename(&caller, &at, &name, &new_name)).await?;
            Ok(listing_redirect(state, &dir, &sort, Some(target.name())))
        }
        Action::Move { names, dest } => {
            let (at, to) = (dir.clone(), dest.clone());
            let outcome = blocking(move || files.move_batch(&caller, &at, names, &to)).await?;
            Ok(listing_redirect(state, &dest, &sort, outcome.last()))
        }
        Action::Delete { names } => {
            let at = dir.clone();
            blocking(move || files.delete_batch(&caller, &at, names)).await?;
            Ok(listing_redirect(state, &dir, &sort, None))
        }
        Action::Logout => Ok(challenge()),
    }
}

/// The failed-login table as plain text.
pub async fn dump_bans(State(state): State<AppState>) -> Response {
    let text = state.auth.bans().map(BanList::dump).unwrap_or_default();
    (
        [(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        )],
        text,
    )
        .into_response()
}

/// Run filesystem work off the async threads.
async fn blocking<T, E>(work: impl FnOnce() -> Result<T, E> + Send + 'static) -> Result<T, HttpError>
where
    T: Send + 'static,
    E: Into<HttpError> + Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| HttpError::Internal(e.to_string()))?
        .map_err(Into::into)
}

fn is_multipart(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("multipart/form-data"))
}

fn form_limit(state: &AppState) -> usize {
    usize::try_from(state.files.settings().edit_limit)
        .unwrap_or(usize::MAX)
        .saturating_mul(3)
        .saturating_add(FORM_OVERHEAD)
}

/// Collect multipart fields, streaming any uploaded file to disk.
///
/// The `dir` field must come before the file field in the form.
async fn read_multipart(
    state: &AppState,
    caller: &Caller,
    fields: &mut FormFields,
    request: Request,
) -> Result<Option<FileTarget>, HttpError> {
    let mut multipart = Multipart::from_request(request, state)
        .await
        .map_err(|e| HttpError::BadRequest(e.body_text()))?;

    let mut uploaded = None;
    while let Some(field) = multipart.next_field().await? {
        let name = field.name().unwrap_or_default().to_string();
        if name != FIELD_UPLOAD_FILE {
            fields.push(name, field.text().await?);
            continue;
        }

        let filename = field.file_name().unwrap_or_default().to_string();
        if filename.is_empty() {
            continue;
        }
        let dir = fields.value(FIELD_DIR).to_string();
        uploaded = Some(receive_upload(state, caller, dir, filename, field).await?);
    }
    Ok(uploaded)
}

/// Messages to the upload writer. The upload is committed only after
/// `Done`; a channel closed without it discards the partial file.
enum UploadChunk {
    Data(Bytes),
    Done,
}

async fn receive_upload(
    state: &AppState,
    caller: &Caller,
    dir: String,
    filename: String,
    mut field: axum::extract::multipart::Field<'_>,
) -> Result<FileTarget, HttpError> {
    let files = state.files.clone();
    let who = caller.clone();
    let mut session = blocking(move || files.begin_upload(&who, &dir, &filename)).await?;

    let (tx, mut rx) = mpsc::channel::<UploadChunk>(UPLOAD_QUEUE);
    let writer = tokio::task::spawn_blocking(move || {
        while let Some(chunk) = rx.blocking_recv() {
            match chunk {
                UploadChunk::Data(bytes) => {
                    if let Err(e) = session.write(&bytes) {
                        session.abort();
                        return Err(e);
                    }
                }
                UploadChunk::Done => return session.finish().map(Some),
            }
        }
        // Reader failed or the request was dropped mid-body.
        session.abort();
        Ok(None)
    });

    let mut read_error = None;
    loop {
        match field.chunk().await {
            Ok(Some(bytes)) => {
                // A closed channel means the writer already failed.
                if tx.send(UploadChunk::Data(bytes)).await.is_err() {
                    break;
                }
            }
            Ok(None) => {
                let _ = tx.send(UploadChunk::Done).await;
                break;
            }
            Err(e) => {
                read_error = Some(e);
                break;
            }
        }
    }
    drop(tx);

    let written = writer
        .await
        .map_err(|e| HttpError::Internal(e.to_string()))?;
    if let Some(e) = read_error {
        warn!(user = %caller, error = %e, "upload interrupted");
        return Err(e.into());
    }
    match written? {
        Some(target) => Ok(target),
        None => Err(HttpError::BadRequest("upload aborted".into())),
    }
}

async fn respond_content(plan: ContentPlan) -> Result<Response, HttpError> {
    match plan {
        ContentPlan::Redirect { location } => {
            let location = HeaderValue::from_str(&location)
                .map_err(|_| HttpError::BadRequest("shortcut url is not a valid header".into()))?;
            Ok((StatusCode::FOUND, [(header::LOCATION, location)]).into_response())
        }
        ContentPlan::Listing { text, .. } => Ok((
            [(
                header::CONTENT_TYPE,
                HeaderValue::from_static("text/plain; charset=utf-8"),
            )],
            text,
        )
            .into_response()),
        ContentPlan::Stream(plan) => stream_file(plan).await,
    }
}

/// Stream a file body in fixed-size chunks.
///
/// Headers go out before the first read. A read error part way through
/// ends the body early, so the client may receive a truncated file.
async fn stream_file(plan: StreamPlan) -> Result<Response, HttpError> {
    let file = tokio::fs::File::open(&plan.path)
        .await
        .map_err(|e| FileError::io("open", plan.path.clone(), e))?;
    let body = Body::from_stream(ReaderStream::with_capacity(file, STREAM_CHUNK_SIZE));

    let mut response = Response::new(body);
    let headers = response.headers_mut();
    if let Ok(mime) = HeaderValue::from_str(&plan.mime) {
        headers.insert(header::CONTENT_TYPE, mime);
    }
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(plan.len));
    if let Some(name) = &plan.attachment {
        if let Ok(value) = HeaderValue::from_str(&content_disposition(name)) {
            headers.insert(header::CONTENT_DISPOSITION, value);
        }
    }
    Ok(response)
}

/// `attachment` disposition with an ASCII fallback and an RFC 5987 name.
fn content_disposition(name: &str) -> String {
    let fallback: String = name
        .chars()
        .map(|c| {
            if c == ' ' || (c.is_ascii_graphic() && c != '"' && c != '\\') {
                c
            } else {
                '_'
            }
        })
        .collect();

    let mut encoded = String::with_capacity(name.len());
    for byte in name.bytes() {
        if byte.is_ascii_alphanumeric() || b"!#$&+-.^_`|~".contains(&byte) {
            encoded.push(byte as char);
        } else {
            encoded.push_str(&format!("%{byte:02X}"));
        }
    }
    format!("attachment; filename=\"{fallback}\"; filename*=UTF-8''{encoded}")
}

fn listing_redirect(state: &AppState, dir: &str, sort: &str, highlight: Option<&str>) -> Response {
    let mut query = form_urlencoded::Serializer::new(String::new());
    query.append_pair(FIELD_DIR, &anchor_path(dir));
    if !sort.is_empty() {
        query.append_pair(FIELD_SORT, sort);
    }
    if let Some(hi) = highlight {
        query.append_pair(FIELD_HIGHLIGHT, hi);
    }
    Redirect::to(&format!("{}?{}", state.prefix, query.finish())).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_disposition_ascii() {
        assert_eq!(
            content_disposition("report.pdf"),
            "attachment; filename=\"report.pdf\"; filename*=UTF-8''report.pdf"
        );
    }

    #[test]
    fn test_content_disposition_escapes() {
        let value = content_disposition("a \"b\" é.txt");
        assert_eq!(
            value,
            "attachment; filename=\"a _b_ _.txt\"; filename*=UTF-8''a%20%22b%22%20%C3%A9.txt"
        );
    }

    #[test]
    fn test_is_multipart() {
        let mut headers = HeaderMap::new();
        assert!(!is_multipart(&headers));
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("multipart/form-data; boundary=x"),
        );
        assert!(is_multipart(&headers));
    }
}
