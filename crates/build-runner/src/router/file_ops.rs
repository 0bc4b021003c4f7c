use std::time::Duration;

use tracing::{info, warn};

use super::RouterContext;
use crate::error::Result;
use crate::protocol::{
    Command, DeleteProjectFilesPayload, EventKind, ListFilesPayload, ReadFilePayload, WriteFilePayload,
};
use crate::state::wait_for_exit;

/// Bound on waiting for a dev server to exit before its files are deleted
const DELETE_EXIT_WAIT: Duration = Duration::from_secs(10);

impl RouterContext {
    pub(super) async fn read_file(&self, command: &Command) -> Result<()> {
        let payload: ReadFilePayload = command.payload()?;
        let dir = self.project_dir(command, payload.project_slug.as_deref())?;
        let (content, encoding) = dir.read_file(&payload.path).await?;
        self.send(
            command,
            EventKind::FileContent {
                path: payload.path,
                content,
                encoding,
            },
        )
        .await;
        Ok(())
    }

    pub(super) async fn write_file(&self, command: &Command) -> Result<()> {
        let payload: WriteFilePayload = command.payload()?;
        let dir = self.project_dir(command, payload.project_slug.as_deref())?;
        let _guard = self.session.lock_project(&command.project_id).await;
        let bytes = dir
            .write_file(&payload.path, &payload.content, payload.encoding)
            .await?;
        self.send(
            command,
            EventKind::FileWritten {
                path: payload.path,
                bytes,
            },
        )
        .await;
        Ok(())
    }

    pub(super) async fn list_files(&self, command: &Command) -> Result<()> {
        let payload: ListFilesPayload = command.payload()?;
        let dir = self.project_dir(command, payload.project_slug.as_deref())?;
        let entries = dir.list_files(payload.path.as_deref()).await?;
        self.send(
            command,
            EventKind::FileList {
                path: payload.path.unwrap_or_default(),
                entries,
            },
        )
        .await;
        Ok(())
    }

    /// Stop the project's dev server, then remove its directory
    pub(super) async fn delete_project_files(&self, command: &Command) -> Result<()> {
        let payload: DeleteProjectFilesPayload = command.payload()?;
        let dir = self.project_dir(command, payload.project_slug.as_deref())?;
        let project_id = command.project_id.as_str();

        // Teardown needs the project lock, so the wait happens outside it
        let pending_exit = {
            let _guard = self.session.lock_project(project_id).await;
            match self.session.process_control(project_id).await {
                Some(control) => {
                    info!(project_id, "Stopping dev server before deleting files");
                    control.stop();
                    self.session.exit_watch(project_id).await
                }
                None => None,
            }
        };
        if let Some(exited) = pending_exit {
            if tokio::time::timeout(DELETE_EXIT_WAIT, wait_for_exit(exited)).await.is_err() {
                warn!(project_id, "Dev server did not exit before delete");
            }
        }

        let _guard = self.session.lock_project(project_id).await;
        dir.delete_all().await?;
        info!(command_id = %command.id, project_id, "Deleted {:?}", dir.root());
        self.send(
            command,
            EventKind::FilesDeleted {
                path: dir.root().display().to_string(),
            },
        )
        .await;
        Ok(())
    }
}
