use axum::{
    body::Body,
    extract::{Multipart, Path as AxumPath, Query, State},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use tracing::{error, info, warn};

use crate::{
    app_state::AppState,
    store::{PutRequest, StoreError},
};

use super::utils::{
    build_content_disposition_header, entry_not_found_response, server_error_response,
};

const USAGE: &str = "codedrop : ephemeral file sharing\n\
\n\
  POST   /         upload a file (multipart field \"file\"; optional key, n, time fields)\n\
  POST   /<code>   upload under a chosen code\n\
  GET    /<code>   fetch a file, spending one download (?key=... when protected)\n\
  DELETE /<code>   remove a file\n";

/// GET / — plain usage text.
pub async fn usage_handler() -> Response {
    (StatusCode::OK, USAGE).into_response()
}

/// POST / and POST /:code — store an uploaded file and answer with its code.
pub async fn upload_handler(
    State(state): State<AppState>,
    code: Option<AxumPath<String>>,
    mut multipart: Multipart,
) -> Response {
    let explicit_code = code.map(|AxumPath(code)| code);

    // fast conflict answer before the body is consumed; the store's
    // reservation remains the authoritative check
    if let Some(code) = explicit_code.as_deref() {
        match state.store().exists(code).await {
            Ok(true) => return code_in_use_response(),
            Ok(false) => {}
            Err(err) => {
                error!(target: "upload", %err, "failed to check code occupancy");
                return server_error_response();
            }
        }
    }

    let mut file: Option<(String, Option<String>, Vec<u8>)> = None;
    let mut key: Option<String> = None;
    let mut downloads: Option<u32> = None;
    let mut ttl: Option<String> = None;

    loop {
        let next_field = match multipart.next_field().await {
            Ok(field) => field,
            Err(err) => {
                warn!(target: "upload", %err, "malformed multipart payload");
                return (
                    StatusCode::BAD_REQUEST,
                    "The upload could not be processed.",
                )
                    .into_response();
            }
        };
        let Some(field) = next_field else {
            break;
        };

        let field_name = field.name().map(|name| name.to_string());
        match field_name.as_deref() {
            Some("file") => {
                if file.is_some() {
                    return (StatusCode::BAD_REQUEST, "Attach one file at a time.")
                        .into_response();
                }

                let filename = field
                    .file_name()
                    .map(|name| name.to_string())
                    .unwrap_or_default();
                let content_type = field.content_type().map(|value| value.to_string());

                match field.bytes().await {
                    Ok(bytes) => file = Some((filename, content_type, bytes.to_vec())),
                    Err(err) => {
                        warn!(target: "upload", %err, "failed to read uploaded file");
                        return (
                            StatusCode::BAD_REQUEST,
                            "The uploaded file could not be read.",
                        )
                            .into_response();
                    }
                }
            }
            Some("key") => match field.text().await {
                Ok(value) if !value.is_empty() => key = Some(value),
                Ok(_) => {}
                Err(err) => {
                    warn!(target: "upload", %err, "failed to read key field");
                    return (StatusCode::BAD_REQUEST, "The key field could not be read.")
                        .into_response();
                }
            },
            Some("n") => match field.text().await.map(|value| value.trim().parse::<i64>()) {
                Ok(Ok(value)) => {
                    downloads = Some(value.clamp(0, i64::from(u32::MAX)) as u32);
                }
                Ok(Err(_)) | Err(_) => {
                    return (
                        StatusCode::BAD_REQUEST,
                        "The download count must be a number.",
                    )
                        .into_response();
                }
            },
            Some("time") => match field.text().await {
                Ok(value) if !value.trim().is_empty() => ttl = Some(value),
                Ok(_) => {}
                Err(err) => {
                    warn!(target: "upload", %err, "failed to read time field");
                    return (StatusCode::BAD_REQUEST, "The time field could not be read.")
                        .into_response();
                }
            },
            _ => {}
        }
    }

    let Some((filename, content_type, payload)) = file else {
        return (StatusCode::BAD_REQUEST, "No file attached.").into_response();
    };

    let content_type = content_type
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| {
            mime_guess::from_path(&filename)
                .first_or_octet_stream()
                .essence_str()
                .to_string()
        });

    let request = PutRequest {
        code: explicit_code,
        payload,
        content_type,
        filename,
        key,
        downloads,
        ttl,
    };

    match state.store().put(request).await {
        Ok(code) => {
            info!(target: "upload", code = %code, "upload accepted");
            (StatusCode::OK, code).into_response()
        }
        Err(err) => put_error_response(err),
    }
}

#[derive(Deserialize)]
pub struct FetchQuery {
    key: Option<String>,
}

/// GET /:code — serve the payload and spend one download.
pub async fn fetch_handler(
    State(state): State<AppState>,
    AxumPath(code): AxumPath<String>,
    Query(query): Query<FetchQuery>,
) -> Response {
    let (payload, meta) = match state.store().get(&code, query.key.as_deref()).await {
        Ok(found) => found,
        Err(StoreError::NotFound) | Err(StoreError::KeyMismatch) => {
            return entry_not_found_response();
        }
        Err(err) => {
            error!(target: "fetch", code = %code, %err, "failed to fetch entry");
            return server_error_response();
        }
    };

    let content_type = HeaderValue::from_str(&meta.content_type).unwrap_or_else(|_| {
        let guess = mime_guess::from_path(&meta.filename).first_or_octet_stream();
        HeaderValue::from_str(guess.essence_str())
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream"))
    });
    let content_disposition = build_content_disposition_header(&meta.filename);

    info!(
        target: "fetch",
        code = %code,
        remaining = meta.remaining_downloads.saturating_sub(1),
        "serving entry"
    );

    let mut response = Response::new(Body::from(payload));
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, content_type);
    headers.insert(header::CONTENT_DISPOSITION, content_disposition);
    headers.insert(
        header::HeaderName::from_static("x-content-type-options"),
        HeaderValue::from_static("nosniff"),
    );

    response
}

/// DELETE /:code — idempotent removal.
pub async fn delete_handler(
    State(state): State<AppState>,
    AxumPath(code): AxumPath<String>,
) -> Response {
    match state.store().delete(&code).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => {
            error!(target: "store", code = %code, %err, "failed to delete entry");
            server_error_response()
        }
    }
}

fn code_in_use_response() -> Response {
    (
        StatusCode::CONFLICT,
        "That code is already in use. Pick another or let one be assigned.",
    )
        .into_response()
}

fn put_error_response(err: StoreError) -> Response {
    match err {
        StoreError::CodeInUse => code_in_use_response(),
        StoreError::InvalidCode { expected } => (
            StatusCode::BAD_REQUEST,
            format!("Codes are {expected} lowercase letters or digits."),
        )
            .into_response(),
        StoreError::CodesExhausted => (
            StatusCode::SERVICE_UNAVAILABLE,
            "No codes are available right now. Try again once entries expire.",
        )
            .into_response(),
        StoreError::InvalidTtl(_) => (
            StatusCode::BAD_REQUEST,
            "That lifetime could not be understood. Try something like \"3 days\" or \"1 min\".",
        )
            .into_response(),
        err => {
            error!(target: "upload", %err, "failed to store upload");
            server_error_response()
        }
    }
}
