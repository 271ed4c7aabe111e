//! Thin CRUD surface over the projection registry. Running projectors pick
//! up the commands written here (stop, reset, delete) on their next poll.

use serde_json::Value;

use crate::error::Error;
use crate::projection::projector::Projector;
use crate::projection::query::Query;
use crate::projection::read_model::{ReadModel, ReadModelProjector};
use crate::projection::{ProjectionStore, ProjectorOptions, Status};
use crate::store::DEFAULT_FETCH_LIMIT;

/// Creates projection runners bound to one store and manages the registry
/// rows of existing projections.
pub struct ProjectionManager<ES>
where
    ES: ProjectionStore + Clone,
{
    store: ES,
}

impl<ES> ProjectionManager<ES>
where
    ES: ProjectionStore + Clone,
{
    pub fn new(store: ES) -> Self {
        Self { store }
    }

    pub fn create_projection(
        &self,
        name: impl Into<String>,
        options: ProjectorOptions,
    ) -> Projector<ES> {
        Projector::new(self.store.clone(), name, options)
    }

    pub fn create_read_model_projection<R: ReadModel>(
        &self,
        name: impl Into<String>,
        read_model: R,
        options: ProjectorOptions,
    ) -> ReadModelProjector<ES, R> {
        ReadModelProjector::new(self.store.clone(), name, read_model, options)
    }

    pub fn create_query(&self) -> Query<ES> {
        Query::new(self.store.clone())
    }

    /// Asks the running projector to stop; it persists and goes idle on its
    /// next poll.
    pub async fn stop_projection(&self, name: &str) -> Result<(), Error> {
        self.write_command(name, Status::Stopping).await
    }

    /// Asks the running projector to reset position and state.
    pub async fn reset_projection(&self, name: &str) -> Result<(), Error> {
        self.write_command(name, Status::Resetting).await
    }

    /// Asks the running projector to delete the projection, optionally
    /// together with its emitted stream or read model.
    pub async fn delete_projection(
        &self,
        name: &str,
        delete_emitted_events: bool,
    ) -> Result<(), Error> {
        let status = if delete_emitted_events {
            Status::DeletingInclEmittedEvents
        } else {
            Status::Deleting
        };
        self.write_command(name, status).await
    }

    /// An UPDATE touching no rows either means the projection is unknown or
    /// that the status column already carried the value; only the former is
    /// an error.
    async fn write_command(&self, name: &str, status: Status) -> Result<(), Error> {
        let rows = self.store.update_projection_status(name, status).await?;
        if rows != 1 && !self.store.projection_exists(name).await? {
            return Err(Error::ProjectionNotFound(name.to_string()));
        }
        Ok(())
    }

    pub async fn fetch_projection_names(
        &self,
        filter: Option<&str>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<String>, Error> {
        self.store
            .fetch_projection_names(filter, false, limit, offset)
            .await
    }

    pub async fn fetch_projection_names_regex(
        &self,
        pattern: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<String>, Error> {
        self.store
            .fetch_projection_names(Some(pattern), true, limit, offset)
            .await
    }

    /// First page of projection names with the default page size.
    pub async fn projection_names(&self) -> Result<Vec<String>, Error> {
        self.fetch_projection_names(None, DEFAULT_FETCH_LIMIT, 0).await
    }

    pub async fn fetch_projection_status(&self, name: &str) -> Result<Status, Error> {
        self.store
            .fetch_projection_status(name)
            .await?
            .ok_or_else(|| Error::ProjectionNotFound(name.to_string()))
    }

    pub async fn fetch_projection_stream_positions(&self, name: &str) -> Result<Value, Error> {
        let (position, _) = self
            .store
            .load_projection(name)
            .await?
            .ok_or_else(|| Error::ProjectionNotFound(name.to_string()))?;
        Ok(position)
    }

    pub async fn fetch_projection_state(&self, name: &str) -> Result<Value, Error> {
        let (_, state) = self
            .store
            .load_projection(name)
            .await?
            .ok_or_else(|| Error::ProjectionNotFound(name.to_string()))?;
        Ok(state)
    }
}
