//! memos-api - HTTP API server for memos-server
//!
//! The binary in `main.rs` wires configuration, logging and middleware
//! around [`router`].

pub mod config;
pub mod error;
pub mod handlers;
pub mod services;

use axum::{
    routing::{get, post, put},
    Router,
};

use memos_db::Database;

pub use error::ApiError;
use handlers::{attachments, memos, uploads};
use services::{AttachmentService, MemoService};

/// Shared state of every handler.
#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub memos: MemoService,
    pub attachments: AttachmentService,
}

impl AppState {
    pub fn new(db: Database, attachments: AttachmentService) -> Self {
        Self {
            memos: MemoService::new(db.clone()),
            db,
            attachments,
        }
    }
}

/// All API routes.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(handlers::health_check))
        // Memos
        .route("/api/v1/memos", get(memos::list_memos).post(memos::create_memo))
        .route("/api/v1/memos/changes", get(memos::list_memo_changes))
        .route(
            "/api/v1/memos/:uid",
            get(memos::get_memo)
                .patch(memos::update_memo)
                .delete(memos::delete_memo),
        )
        .route("/api/v1/users/:id/tags", get(memos::get_user_tag_count))
        // Attachments
        .route(
            "/api/v1/attachments",
            get(attachments::list_attachments).post(attachments::create_attachment),
        )
        .route(
            "/api/v1/attachments/:uid",
            get(attachments::get_attachment).delete(attachments::delete_attachment),
        )
        .route("/file/attachments/:uid", get(attachments::download_attachment))
        // Resumable uploads
        .route("/api/v1/uploads", post(uploads::create_upload_session))
        .route(
            "/api/v1/uploads/:id",
            get(uploads::get_upload_progress)
                .patch(uploads::append_upload_chunk)
                .delete(uploads::cancel_upload_session),
        )
        .route("/api/v1/uploads/:id/thumbnail", put(uploads::upload_thumbnail))
        .route("/api/v1/uploads/:id/parts", post(uploads::create_part_upload_url))
        .route("/api/v1/uploads/:id/complete", post(uploads::complete_upload_session))
        .with_state(state)
}
