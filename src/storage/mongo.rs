use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use mongodb::bson::{doc, Document};
use mongodb::options::{ClientOptions, FindOptions, ReplaceOptions};
use mongodb::{Client, Collection, Database};
use tracing::debug;

use crate::cli::config::JobStoreSettings;
use crate::crawler::job::CloneJob;
use crate::storage::jobs::JobStore;

/// MongoDB implementation of JobStore
pub struct MongoJobStore {
    /// MongoDB database
    database: Database,

    /// Collection prefix
    collection_prefix: String,
}

impl MongoJobStore {
    /// Create a new MongoDB job store
    pub async fn new(settings: &JobStoreSettings) -> Result<Self> {
        // Parse connection options
        let client_options = ClientOptions::parse(&settings.connection_string)
            .await
            .context(format!("Failed to parse MongoDB connection string: {}", settings.connection_string))?;

        let client = Client::with_options(client_options)
            .context("Failed to create MongoDB client")?;

        let database = client.database(&settings.database_name);

        // Test connection
        database.list_collection_names(None)
            .await
            .context("Failed to connect to MongoDB")?;

        debug!("Connected to MongoDB database: {}", settings.database_name);

        Ok(Self {
            database,
            collection_prefix: settings.collection_prefix.clone(),
        })
    }

    /// Get the collection for jobs
    fn jobs_collection(&self) -> Collection<Document> {
        self.database.collection(&format!("{}_jobs", self.collection_prefix))
    }
}

#[async_trait]
impl JobStore for MongoJobStore {
    async fn save(&self, job: &CloneJob) -> Result<()> {
        let collection = self.jobs_collection();

        let document = mongodb::bson::to_document(job)
            .context("Failed to convert job to BSON document")?;

        // Upsert by job id
        collection.replace_one(
            doc! { "id": &job.id },
            document,
            ReplaceOptions::builder().upsert(true).build(),
        )
        .await
        .context("Failed to store job in MongoDB")?;

        debug!("Stored job {} ({})", job.id, job.status);
        Ok(())
    }

    async fn load(&self, job_id: &str) -> Result<Option<CloneJob>> {
        let result = self.jobs_collection()
            .find_one(doc! { "id": job_id }, None)
            .await
            .context("Failed to query MongoDB for job")?;

        match result {
            Some(document) => {
                let job = mongodb::bson::from_document(document)
                    .context("Failed to convert BSON document to job")?;
                Ok(Some(job))
            }
            None => Ok(None),
        }
    }

    async fn list(&self) -> Result<Vec<CloneJob>> {
        let options = FindOptions::builder().sort(doc! { "created_at": -1 }).build();
        let mut cursor = self.jobs_collection()
            .find(None, options)
            .await
            .context("Failed to query MongoDB for jobs")?;

        let mut jobs = Vec::new();
        while let Some(document) = cursor.next().await {
            let document = document.context("Failed to get document from cursor")?;
            let job: CloneJob = mongodb::bson::from_document(document)
                .context("Failed to convert BSON document to job")?;
            jobs.push(job);
        }

        Ok(jobs)
    }

    async fn delete(&self, job_id: &str) -> Result<()> {
        self.jobs_collection()
            .delete_one(doc! { "id": job_id }, None)
            .await
            .context("Failed to delete job from MongoDB")?;

        debug!("Deleted job: {}", job_id);
        Ok(())
    }
}
