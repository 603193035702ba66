//! Work-done progress reporting.
//!
//! Wraps the `window/workDoneProgress/create` + `$/progress` handshake;
//! a reporter created for a client that did not advertise progress
//! support is a no-op.

use tower_lsp::lsp_types::{
    NumberOrString, ProgressParams, ProgressParamsValue, WorkDoneProgress, WorkDoneProgressBegin,
    WorkDoneProgressCreateParams, WorkDoneProgressEnd, WorkDoneProgressReport,
};
use tower_lsp::Client;

pub struct ProgressReporter {
    client: Client,
    token: Option<NumberOrString>,
}

impl ProgressReporter {
    /// Creates a progress token and sends the begin notification.
    pub async fn begin(client: Client, enabled: bool, title: &str, counter: u64) -> Self {
        if !enabled {
            return Self {
                client,
                token: None,
            };
        }
        let token = NumberOrString::String(format!("stexls/{title}/{counter}"));
        if client
            .send_request::<tower_lsp::lsp_types::request::WorkDoneProgressCreate>(
                WorkDoneProgressCreateParams {
                    token: token.clone(),
                },
            )
            .await
            .is_err()
        {
            return Self {
                client,
                token: None,
            };
        }
        client
            .send_notification::<tower_lsp::lsp_types::notification::Progress>(ProgressParams {
                token: token.clone(),
                value: ProgressParamsValue::WorkDone(WorkDoneProgress::Begin(
                    WorkDoneProgressBegin {
                        title: title.to_string(),
                        ..Default::default()
                    },
                )),
            })
            .await;
        Self {
            client,
            token: Some(token),
        }
    }

    pub async fn report(&self, message: impl Into<String>) {
        let Some(token) = &self.token else {
            return;
        };
        self.client
            .send_notification::<tower_lsp::lsp_types::notification::Progress>(ProgressParams {
                token: token.clone(),
                value: ProgressParamsValue::WorkDone(WorkDoneProgress::Report(
                    WorkDoneProgressReport {
                        message: Some(message.into()),
                        ..Default::default()
                    },
                )),
            })
            .await;
    }

    pub async fn end(self) {
        let Some(token) = self.token else {
            return;
        };
        self.client
            .send_notification::<tower_lsp::lsp_types::notification::Progress>(ProgressParams {
                token,
                value: ProgressParamsValue::WorkDone(WorkDoneProgress::End(
                    WorkDoneProgressEnd { message: None },
                )),
            })
            .await;
    }
}
