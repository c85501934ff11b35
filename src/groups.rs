//! Group rules on top of a [`GroupRepository`]
//!
//! Who may edit what lives here; the repository only stores.

use chrono::Utc;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

use crate::error::{Error, Result};
use crate::importer::DocumentImporter;
use crate::models::{Group, GroupPatch, NewGroup, UserProfile, Weekday};
use crate::repository::{GroupRepository, WriteOutcome};

/// Raw values from the group form.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GroupForm {
    pub title: String,
    pub description: String,
    pub location: String,
    /// Weekday names as typed or picked (`"segunda"`, `"Sexta-feira"`, ...).
    pub rehearsal_days: Vec<String>,
    /// `YYYY-MM-DD`, or empty for none.
    pub presentation_date: String,
    pub participants: Vec<String>,
}

impl GroupForm {
    pub fn new(title: &str) -> Self {
        Self {
            title: title.to_string(),
            ..Default::default()
        }
    }

    pub fn into_new_group(self, creator: &str) -> Result<NewGroup> {
        if self.title.trim().is_empty() {
            return Err(Error::validation("title is required"));
        }
        let presentation_date = GroupPatch::default()
            .presentation_date(&self.presentation_date)?
            .presentation_date
            .flatten();

        Ok(NewGroup {
            title: self.title,
            description: self.description,
            location: self.location,
            rehearsal_days: Weekday::normalize(self.rehearsal_days.iter().map(String::as_str)),
            presentation_date,
            creator: creator.to_string(),
            participants: self.participants,
            ..Default::default()
        })
    }
}

/// Text field filled by a document import.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportField {
    Script,
    Scenery,
    Costumes,
}

impl ImportField {
    fn patch(self, text: &str) -> GroupPatch {
        let patch = GroupPatch::default();
        match self {
            ImportField::Script => patch.script(text),
            ImportField::Scenery => patch.scenery(text),
            ImportField::Costumes => patch.costumes(text),
        }
    }
}

pub struct GroupService<R: GroupRepository + ?Sized> {
    repository: Arc<R>,
    importer: DocumentImporter,
}

impl<R: GroupRepository + ?Sized> GroupService<R> {
    pub fn new(repository: Arc<R>) -> Self {
        Self {
            repository,
            importer: DocumentImporter::new(),
        }
    }

    pub fn repository(&self) -> &Arc<R> {
        &self.repository
    }

    pub async fn my_groups(&self, user: &UserProfile) -> Result<Vec<Group>> {
        self.repository.list(&user.id).await
    }

    pub async fn get(&self, id: &str) -> Result<Group> {
        self.repository
            .get(id)
            .await?
            .ok_or_else(|| Error::not_found(format!("group {}", id)))
    }

    pub async fn create(&self, user: &UserProfile, form: GroupForm) -> Result<Group> {
        let group = form.into_new_group(&user.id)?;
        let created = self.repository.create(group).await?;
        info!(id = %created.id, title = %created.title, "group created");
        Ok(created)
    }

    pub async fn edit(&self, user: &UserProfile, id: &str, patch: GroupPatch) -> Result<WriteOutcome> {
        let group = self.get(id).await?;
        require_owner(user, &group)?;
        if patch.is_empty() {
            return Ok(WriteOutcome::Synced);
        }
        if matches!(&patch.title, Some(t) if t.trim().is_empty()) {
            return Err(Error::validation("title cannot be blank"));
        }
        if patch
            .participants
            .as_ref()
            .map_or(false, |p| !p.contains(&group.creator))
        {
            return Err(Error::validation("the creator cannot be removed"));
        }
        self.repository.update(id, patch).await
    }

    pub async fn remove(&self, user: &UserProfile, id: &str) -> Result<WriteOutcome> {
        let group = self.get(id).await?;
        require_owner(user, &group)?;
        self.repository.delete(id).await
    }

    pub async fn invite(&self, user: &UserProfile, id: &str, participant_id: &str) -> Result<WriteOutcome> {
        let participant_id = participant_id.trim();
        if participant_id.is_empty() {
            return Err(Error::validation("participant is required"));
        }
        let group = self.get(id).await?;
        require_owner(user, &group)?;
        if group.is_member(participant_id) {
            return Ok(WriteOutcome::Synced);
        }

        let mut participants = group.participants;
        participants.push(participant_id.to_string());
        self.set_participants(id, participants).await
    }

    pub async fn remove_participant(
        &self,
        user: &UserProfile,
        id: &str,
        participant_id: &str,
    ) -> Result<WriteOutcome> {
        let group = self.get(id).await?;
        require_owner(user, &group)?;
        if participant_id == group.creator {
            return Err(Error::validation("the creator cannot be removed"));
        }
        self.drop_participant(group, participant_id).await
    }

    pub async fn leave(&self, user: &UserProfile, id: &str) -> Result<WriteOutcome> {
        let group = self.get(id).await?;
        if user.id == group.creator {
            return Err(Error::validation("the creator cannot leave the group"));
        }
        self.drop_participant(group, &user.id).await
    }

    pub async fn set_alert(&self, user: &UserProfile, id: &str, message: &str) -> Result<WriteOutcome> {
        if message.trim().is_empty() {
            return Err(Error::validation("alert message is required"));
        }
        let group = self.get(id).await?;
        require_owner(user, &group)?;
        let patch = GroupPatch {
            alert: Some(true),
            alert_message: Some(message.trim().to_string()),
            ..Default::default()
        };
        self.repository.update(id, patch).await
    }

    pub async fn clear_alert(&self, user: &UserProfile, id: &str) -> Result<WriteOutcome> {
        let group = self.get(id).await?;
        require_owner(user, &group)?;
        let patch = GroupPatch {
            alert: Some(false),
            alert_message: Some(String::new()),
            ..Default::default()
        };
        self.repository.update(id, patch).await
    }

    /// Reads a `.docx` or `.txt` file into one of the group's text fields.
    /// Any member may import.
    pub async fn import_into(
        &self,
        user: &UserProfile,
        id: &str,
        field: ImportField,
        path: &Path,
    ) -> Result<WriteOutcome> {
        let group = self.get(id).await?;
        if !group.is_member(&user.id) && !user.is_admin() {
            return Err(Error::permission_denied("only members can edit this group"));
        }
        let text = self.importer.import_path(path).await?;
        info!(id, ?field, chars = text.chars().count(), "document imported");
        self.repository.update(id, field.patch(&text)).await
    }

    async fn drop_participant(&self, group: Group, participant_id: &str) -> Result<WriteOutcome> {
        if !group.participants.iter().any(|p| p == participant_id) {
            return Err(Error::not_found(format!(
                "{} is not a participant of group {}",
                participant_id, group.id
            )));
        }
        let participants = group
            .participants
            .into_iter()
            .filter(|p| p != participant_id)
            .collect();
        self.set_participants(&group.id, participants).await
    }

    async fn set_participants(&self, id: &str, participants: Vec<String>) -> Result<WriteOutcome> {
        let patch = GroupPatch {
            participants: Some(participants),
            updated_at: Some(Utc::now()),
            ..Default::default()
        };
        self.repository.update(id, patch).await
    }
}

fn require_owner(user: &UserProfile, group: &Group) -> Result<()> {
    if group.creator == user.id || user.is_admin() {
        Ok(())
    } else {
        Err(Error::permission_denied(
            "only the creator or an admin can change this group",
        ))
    }
}
