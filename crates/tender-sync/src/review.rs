//! Detail view of one tender with an edit buffer and optimistic merge on save.

use tender_api::{ApiError, TenderApi};
use tender_core::{CorrectableFields, Tender, TenderCorrection, TenderFilters};
use thiserror::Error;
use tracing::{info, warn};

use crate::filters::TenderListCache;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewState {
    Closed,
    Viewing,
    Editing,
}

#[derive(Debug, Error)]
pub enum ReviewError {
    #[error("no tender is open")]
    NotOpen,
    #[error("tender is not being edited")]
    NotEditing,
    #[error(transparent)]
    Save(#[from] ApiError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    /// `merged_into_list` is false when the listing entry was not cached or
    /// does not contain the row.
    Saved { merged_into_list: bool },
    NoChanges,
}

#[derive(Debug, Clone)]
pub struct ReviewController {
    state: ReviewState,
    open: Option<Tender>,
    buffer: CorrectableFields,
}

impl Default for ReviewController {
    fn default() -> Self {
        Self {
            state: ReviewState::Closed,
            open: None,
            buffer: CorrectableFields::default(),
        }
    }
}

impl ReviewController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> ReviewState {
        self.state
    }

    pub fn tender(&self) -> Option<&Tender> {
        self.open.as_ref()
    }

    pub fn buffer(&self) -> &CorrectableFields {
        &self.buffer
    }

    /// Opens `tender` for viewing, replacing whatever was open. Unsaved edits are dropped.
    pub fn open(&mut self, tender: Tender) {
        self.buffer = tender.correctable_fields();
        self.open = Some(tender);
        self.state = ReviewState::Viewing;
    }

    pub fn close(&mut self) {
        self.open = None;
        self.buffer = CorrectableFields::default();
        self.state = ReviewState::Closed;
    }

    pub fn begin_edit(&mut self) -> Result<(), ReviewError> {
        match self.state {
            ReviewState::Closed => Err(ReviewError::NotOpen),
            ReviewState::Viewing | ReviewState::Editing => {
                self.state = ReviewState::Editing;
                Ok(())
            }
        }
    }

    pub fn buffer_mut(&mut self) -> Result<&mut CorrectableFields, ReviewError> {
        match self.state {
            ReviewState::Editing => Ok(&mut self.buffer),
            ReviewState::Closed => Err(ReviewError::NotOpen),
            ReviewState::Viewing => Err(ReviewError::NotEditing),
        }
    }

    /// Discards the buffer and reloads it from the open record.
    pub fn cancel_edit(&mut self) -> Result<(), ReviewError> {
        let tender = self.editing_tender()?;
        self.buffer = tender.correctable_fields();
        self.state = ReviewState::Viewing;
        Ok(())
    }

    /// Fields that differ between the buffer and the open record.
    pub fn pending_changes(&self) -> Option<TenderCorrection> {
        self.open
            .as_ref()
            .map(|tender| tender.correctable_fields().diff(&self.buffer))
    }

    fn editing_tender(&self) -> Result<&Tender, ReviewError> {
        match (self.state, &self.open) {
            (ReviewState::Editing, Some(tender)) => Ok(tender),
            (ReviewState::Viewing, Some(_)) => Err(ReviewError::NotEditing),
            _ => Err(ReviewError::NotOpen),
        }
    }

    /// Sends the changed fields and, on success, merges them into the open
    /// record and the cached row under `list_key` without refetching the list.
    ///
    /// On failure the controller stays in edit mode with the buffer intact.
    pub async fn save(
        &mut self,
        api: &dyn TenderApi,
        list: &TenderListCache,
        list_key: &TenderFilters,
    ) -> Result<SaveOutcome, ReviewError> {
        let tender = self.editing_tender()?;
        let id = tender.id;
        let correction = tender.correctable_fields().diff(&self.buffer);
        if correction.is_empty() {
            self.state = ReviewState::Viewing;
            return Ok(SaveOutcome::NoChanges);
        }

        if let Err(err) = api.update_tender(id, &correction).await {
            warn!(tender_id = id, error = %err, "correction rejected");
            return Err(err.into());
        }

        if let Some(open) = self.open.as_mut() {
            correction.apply_to(open);
            self.buffer = open.correctable_fields();
        }
        let merged_into_list = list
            .mutate(list_key, |rows| match rows.iter_mut().find(|row| row.id == id) {
                Some(row) => {
                    correction.apply_to(row);
                    true
                }
                None => false,
            })
            .unwrap_or(false);
        self.state = ReviewState::Viewing;
        info!(tender_id = id, merged_into_list, "correction saved");
        Ok(SaveOutcome::Saved { merged_into_list })
    }
}
