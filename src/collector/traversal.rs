//! One client's unit of work: client → projects → phone pages.
//!
//! Shared by both orchestrators. Every phone written to the store is counted
//! in the unit's tally, including phones written before the unit failed or was
//! cancelled. Only a finished unit marks its client processed.

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::collector::normalizer::PhoneNormalizer;
use crate::collector::rate_limiter::RateLimiter;
use crate::domain::{
    Client, CollectionStore, NewPhone, PhoneSource, Project, ProjectPhoneLink, RawPhoneRecord,
    UnitTally,
};

pub(crate) struct UnitContext<'a> {
    pub source: &'a dyn PhoneSource,
    pub store: &'a dyn CollectionStore,
    pub rate_limiter: &'a RateLimiter,
    pub normalizer: PhoneNormalizer,
    pub run_id: i64,
    pub limit_projects: Option<usize>,
    pub max_pages: Option<u32>,
    /// Checked between projects and pages. `None` lets a started unit run to completion.
    pub cancel: Option<&'a CancellationToken>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UnitOutcome {
    Finished,
    Cancelled,
}

/// What a unit wrote, and how it ended.
#[derive(Debug)]
pub(crate) struct UnitReport {
    pub tally: UnitTally,
    pub result: Result<UnitOutcome>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PageWalk {
    Exhausted,
    Cancelled,
}

impl UnitContext<'_> {
    fn is_cancelled(&self) -> bool {
        self.cancel.is_some_and(CancellationToken::is_cancelled)
    }
}

pub(crate) async fn collect_client(ctx: &UnitContext<'_>, client: &Client) -> UnitReport {
    let mut tally = UnitTally::default();
    let result = walk_client(ctx, client, &mut tally).await;
    UnitReport { tally, result }
}

async fn walk_client(ctx: &UnitContext<'_>, client: &Client, tally: &mut UnitTally) -> Result<UnitOutcome> {
    ctx.store
        .upsert_client(client)
        .await
        .with_context(|| format!("Failed to save client {}", client.id))?;

    ctx.rate_limiter.wait().await;
    let mut projects = ctx
        .source
        .list_projects(client.id)
        .await
        .with_context(|| format!("Failed to list projects of client {}", client.id))?;

    if let Some(limit) = ctx.limit_projects {
        projects.truncate(limit);
    }
    debug!("Client {} ({}): {} projects", client.id, client.display_name, projects.len());

    for project in &projects {
        if ctx.is_cancelled() {
            return Ok(UnitOutcome::Cancelled);
        }

        ctx.store
            .upsert_project(project)
            .await
            .with_context(|| format!("Failed to save project {}", project.id))?;
        tally.projects += 1;

        if walk_phone_pages(ctx, project, tally).await? == PageWalk::Cancelled {
            return Ok(UnitOutcome::Cancelled);
        }
    }

    Ok(UnitOutcome::Finished)
}

async fn walk_phone_pages(ctx: &UnitContext<'_>, project: &Project, tally: &mut UnitTally) -> Result<PageWalk> {
    let mut page = 1u32;
    loop {
        if ctx.is_cancelled() {
            return Ok(PageWalk::Cancelled);
        }
        if ctx.max_pages.is_some_and(|max| page > max) {
            trace!("Project {}: page limit reached", project.id);
            return Ok(PageWalk::Exhausted);
        }

        ctx.rate_limiter.wait().await;
        let records = ctx
            .source
            .list_phone_page(project.id, page)
            .await
            .with_context(|| format!("Failed to fetch page {} of project {}", page, project.id))?;

        if records.is_empty() {
            trace!("Project {}: {} pages", project.id, page - 1);
            return Ok(PageWalk::Exhausted);
        }

        for record in &records {
            record_phone(ctx, project, record, tally).await?;
        }
        page += 1;
    }
}

async fn record_phone(
    ctx: &UnitContext<'_>,
    project: &Project,
    record: &RawPhoneRecord,
    tally: &mut UnitTally,
) -> Result<()> {
    let Some(e164) = ctx.normalizer.normalize(&record.raw_text) else {
        trace!("Skipping invalid phone {:?} in project {}", record.raw_text, project.id);
        return Ok(());
    };

    let phone_id = match ctx.store.find_phone_by_canonical(&e164).await? {
        Some(existing) => existing.id,
        None => {
            let inserted = ctx
                .store
                .insert_phone(&NewPhone {
                    e164: &e164,
                    original_text: &record.raw_text,
                    run_id: ctx.run_id,
                })
                .await
                .with_context(|| format!("Failed to save phone {e164}"))?;
            if inserted.created {
                tally.new_phones += 1;
            }
            inserted.id
        }
    };

    ctx.store
        .link_project_phone(&ProjectPhoneLink {
            project_id: project.id,
            phone_id,
            run_id: ctx.run_id,
            api_created_at: record.source_timestamp.clone(),
        })
        .await
        .with_context(|| format!("Failed to link phone {} to project {}", phone_id, project.id))?;

    tally.phones += 1;
    Ok(())
}
