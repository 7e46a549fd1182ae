use bytes::Bytes;
use log::*;
use oss_lib::{
    parse_bytes_range, Coordinator, MetaInfo, MetaInfoValue, MetaStore, OssError, OssResult,
    HEADER_BYTES_RANGE, HEADER_FRAGMENT_INDEX, HEADER_IS_LAST, HEADER_PATH,
    HEADER_REGISTRY_VERSION, REGISTRY_VERSION,
};
use std::convert::Infallible;
use std::sync::Arc;
use warp::http::StatusCode;
use warp::reply::Response;
use warp::{Filter, Reply};

#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<Coordinator>,
    pub meta_store: Arc<dyn MetaStore>,
}

fn with_state(
    state: AppState,
) -> impl Filter<Extract = (AppState,), Error = Infallible> + Clone {
    warp::any().map(move || state.clone())
}

/// Fragment protocol routes. All operations address the file through the
/// `Path` header rather than the URL; a GET carrying the fragment headers
/// reads one fragment, a GET with only `Path` streams the whole file.
pub fn routes(
    state: AppState,
) -> impl Filter<Extract = (impl Reply,), Error = warp::Rejection> + Clone {
    let upload = warp::path!("v1" / "file")
        .and(warp::post())
        .and(warp::header::<String>(HEADER_PATH))
        .and(warp::header::<u64>(HEADER_FRAGMENT_INDEX))
        .and(warp::header::<String>(HEADER_BYTES_RANGE))
        .and(warp::header::<bool>(HEADER_IS_LAST))
        .and(warp::header::optional::<String>(HEADER_REGISTRY_VERSION))
        .and(warp::body::bytes())
        .and(with_state(state.clone()))
        .and_then(handle_upload);

    let file_info = warp::path!("v1" / "file" / "info")
        .and(warp::get())
        .and(warp::header::<String>(HEADER_PATH))
        .and(with_state(state.clone()))
        .and_then(handle_file_info);

    let fragment_download = warp::path!("v1" / "file")
        .and(warp::get())
        .and(warp::header::<String>(HEADER_PATH))
        .and(warp::header::<u64>(HEADER_FRAGMENT_INDEX))
        .and(warp::header::<String>(HEADER_BYTES_RANGE))
        .and(warp::header::<bool>(HEADER_IS_LAST))
        .and(warp::header::optional::<String>(HEADER_REGISTRY_VERSION))
        .and(with_state(state.clone()))
        .and_then(handle_fragment_download);

    let download = warp::path!("v1" / "file")
        .and(warp::get())
        .and(warp::header::<String>(HEADER_PATH))
        .and(with_state(state.clone()))
        .and_then(handle_download);

    let delete = warp::path!("v1" / "file")
        .and(warp::delete())
        .and(warp::header::<String>(HEADER_PATH))
        .and(with_state(state))
        .and_then(handle_delete);

    file_info
        .or(upload)
        .or(fragment_download)
        .or(download)
        .or(delete)
}

/// Unknown protocol versions are tolerated and logged, never rejected.
fn check_registry_version(version: Option<&str>) {
    if let Some(version) = version {
        if version != REGISTRY_VERSION {
            debug!("apiserver: ignoring unknown registry version {}", version);
        }
    }
}

/// Translate a core error once, at the boundary. Retry policy belongs to
/// the caller.
fn error_response(err: &OssError) -> Response {
    let code = match err {
        OssError::InvalidParam(_) => StatusCode::BAD_REQUEST,
        OssError::NotFound(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    warn!("apiserver: request failed: {}", err);
    let body = warp::reply::json(&serde_json::json!({ "error": err.to_string() }));
    warp::reply::with_status(body, code).into_response()
}

async fn handle_upload(
    path: String,
    index: u64,
    range: String,
    is_last: bool,
    version: Option<String>,
    body: Bytes,
    state: AppState,
) -> Result<Response, Infallible> {
    check_registry_version(version.as_deref());
    Ok(match upload_fragment(state, path, index, range, is_last, body).await {
        Ok(value) => warp::reply::json(&value).into_response(),
        Err(e) => error_response(&e),
    })
}

async fn upload_fragment(
    state: AppState,
    path: String,
    index: u64,
    range: String,
    is_last: bool,
    body: Bytes,
) -> OssResult<MetaInfoValue> {
    let (start, end) = parse_bytes_range(&range)?;
    let value = state
        .coordinator
        .write_fragment(&path, index, start, end, is_last, body.to_vec())
        .await?;
    // persisted only after every replica acknowledged
    state.meta_store.store_meta_info(&MetaInfo {
        path,
        value: value.clone(),
    })?;
    Ok(value)
}

fn octet_response(bytes: Vec<u8>) -> Response {
    warp::http::Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", "application/octet-stream")
        .body(bytes.into())
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

async fn handle_fragment_download(
    path: String,
    index: u64,
    range: String,
    _is_last: bool,
    version: Option<String>,
    state: AppState,
) -> Result<Response, Infallible> {
    check_registry_version(version.as_deref());
    Ok(match download_fragment(state, &path, index, &range).await {
        Ok(bytes) => octet_response(bytes),
        Err(e) => error_response(&e),
    })
}

/// Fragment-addressed read: the headers carry the placement key, the stored
/// record resolves the group and fid.
async fn download_fragment(
    state: AppState,
    path: &str,
    index: u64,
    range: &str,
) -> OssResult<Vec<u8>> {
    let (start, end) = parse_bytes_range(range)?;
    let value = state
        .meta_store
        .get_fragment_meta_info(path, index, start, end)?;
    state.coordinator.read_fragment(path, &value).await
}

async fn handle_download(path: String, state: AppState) -> Result<Response, Infallible> {
    Ok(match download_file(state, &path).await {
        Ok(bytes) => octet_response(bytes),
        Err(e) => error_response(&e),
    })
}

async fn download_file(state: AppState, path: &str) -> OssResult<Vec<u8>> {
    let values = state.meta_store.get_file_meta_info(path, false)?;
    let mut out = Vec::new();
    for value in &values {
        let bytes = state.coordinator.read_fragment(path, value).await?;
        out.extend_from_slice(&bytes);
    }
    Ok(out)
}

async fn handle_file_info(path: String, state: AppState) -> Result<Response, Infallible> {
    Ok(match state.meta_store.get_file_meta_info(&path, false) {
        Ok(values) => warp::reply::json(&values).into_response(),
        Err(e) => error_response(&e),
    })
}

async fn handle_delete(path: String, state: AppState) -> Result<Response, Infallible> {
    Ok(match state.meta_store.delete_file_meta_info(&path) {
        Ok(()) => warp::reply::json(&serde_json::json!({})).into_response(),
        Err(e) => error_response(&e),
    })
}
