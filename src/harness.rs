//! Line-oriented demonstration harness: trigger likes, comments and posts through a chosen
//! pipeline and compare stored counters with the true counts.

use crate::config::TallyConfig;
use crate::core::{
    AggregateKey, CounterSpec, DetailId, EntityId, LIKES, NewDetail, OwnerRole, POSTS, Result,
    TallyError,
};
use crate::facade::TallyDb;
use crate::feed::{ChangeSubscription, Checkpoint};
use crate::pipeline::{CounterListener, MutationPipeline, PipelineKind};
use crate::reconcile::RepairMode;
use crate::storage::FaultPoint;
use futures::future::join_all;
use std::fmt;
use std::fmt::Write as _;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Like { user: EntityId, post: EntityId },
    Unlike { user: EntityId, post: EntityId },
    Comment {
        user: EntityId,
        post: EntityId,
        text: String,
    },
    Post { user: EntityId },
    /// Remove every record of a collection owned by an entity, bypassing the pipeline.
    Purge { collection: String, owner: EntityId },
    Report { entity: EntityId },
    Reconcile { repair: bool },
    Fail { point: FaultPoint, count: usize },
    Pipeline(PipelineKind),
    Help,
}

pub const HELP: &str = "\
commands:
  like <user> <post>             like a post
  unlike <user> <post>           remove a like
  comment <user> <post> [text]   comment on a post
  post <user>                    publish a post
  purge <collection> <owner>     delete records without touching counters
  report <entity>                stored vs true counters
  reconcile [repair]             check every counter, optionally repair
  fail <point> [n]               fail the next n hits of a fault point
  pipeline <name>                dual-write | transactional | event | on-demand";

fn arg(words: &[&str], index: usize, name: &str) -> Result<EntityId> {
    words
        .get(index)
        .map(|word| EntityId::from(*word))
        .ok_or_else(|| TallyError::Parse(format!("missing <{}>", name)))
}

impl FromStr for Command {
    type Err = TallyError;

    fn from_str(line: &str) -> Result<Self> {
        let words: Vec<&str> = line.split_whitespace().collect();
        let Some((&verb, _)) = words.split_first() else {
            return Err(TallyError::Parse("empty command".into()));
        };

        let command = match verb.to_ascii_lowercase().as_str() {
            "like" => Command::Like {
                user: arg(&words, 1, "user")?,
                post: arg(&words, 2, "post")?,
            },
            "unlike" => Command::Unlike {
                user: arg(&words, 1, "user")?,
                post: arg(&words, 2, "post")?,
            },
            "comment" => Command::Comment {
                user: arg(&words, 1, "user")?,
                post: arg(&words, 2, "post")?,
                text: words.get(3..).map(|rest| rest.join(" ")).unwrap_or_default(),
            },
            "post" => Command::Post {
                user: arg(&words, 1, "user")?,
            },
            "purge" => Command::Purge {
                collection: arg(&words, 1, "collection")?.0,
                owner: arg(&words, 2, "owner")?,
            },
            "report" => Command::Report {
                entity: arg(&words, 1, "entity")?,
            },
            "reconcile" => match words.get(1) {
                None => Command::Reconcile { repair: false },
                Some(&"repair") => Command::Reconcile { repair: true },
                Some(other) => {
                    return Err(TallyError::Parse(format!(
                        "unexpected argument '{}' to reconcile",
                        other
                    )));
                }
            },
            "fail" => Command::Fail {
                point: arg(&words, 1, "point")?.as_str().parse()?,
                count: match words.get(2) {
                    Some(n) => n
                        .parse()
                        .map_err(|_| TallyError::Parse(format!("invalid count '{}'", n)))?,
                    None => 1,
                },
            },
            "pipeline" => Command::Pipeline(arg(&words, 1, "name")?.as_str().parse()?),
            "help" => Command::Help,
            other => return Err(TallyError::Parse(format!("unknown command '{}'", other))),
        };
        Ok(command)
    }
}

/// Runs [`Command`]s against one [`TallyDb`].
///
/// With the event pipeline the listener catches up after every mutation, so reports show the
/// state a caller would see once the feed has been drained.
pub struct Harness {
    db: TallyDb,
    kind: PipelineKind,
    pipeline: Box<dyn MutationPipeline>,
    listener: CounterListener,
    subscription: Option<ChangeSubscription>,
}

impl Harness {
    pub fn new(db: TallyDb, kind: PipelineKind) -> Self {
        let pipeline = db.pipeline(kind);
        let listener = db.listener("harness");
        Self {
            db,
            kind,
            pipeline,
            listener,
            subscription: None,
        }
    }

    pub fn db(&self) -> &TallyDb {
        &self.db
    }

    pub fn pipeline_kind(&self) -> PipelineKind {
        self.kind
    }

    pub async fn execute_line(&mut self, line: &str) -> Result<String> {
        let command: Command = line.parse()?;
        self.execute(command).await
    }

    pub async fn execute(&mut self, command: Command) -> Result<String> {
        self.attach().await?;
        match command {
            Command::Like { user, post } => {
                let outcome = self
                    .pipeline
                    .create(NewDetail::like(user.clone(), post.clone()))
                    .await?;
                let mut out =
                    format!("{} liked {} ({})", user, post, describe(outcome.detail_id()));
                self.drain(&mut out).await?;
                Ok(out)
            }
            Command::Unlike { user, post } => {
                let record = self
                    .db
                    .store()
                    .find_detail(LIKES, &user, &post)
                    .await?
                    .ok_or_else(|| {
                        TallyError::Execution(format!("{} has not liked {}", user, post))
                    })?;
                self.pipeline.delete(record.id).await?;
                let mut out = format!("{} unliked {}", user, post);
                self.drain(&mut out).await?;
                Ok(out)
            }
            Command::Comment { user, post, text } => {
                let outcome = self
                    .pipeline
                    .create(NewDetail::comment(user.clone(), post.clone(), &text))
                    .await?;
                let mut out = format!(
                    "{} commented on {} ({})",
                    user,
                    post,
                    describe(outcome.detail_id())
                );
                self.drain(&mut out).await?;
                Ok(out)
            }
            Command::Post { user } => {
                let outcome = self.pipeline.create(NewDetail::new(POSTS, user.clone())).await?;
                let mut out = format!("{} posted ({})", user, describe(outcome.detail_id()));
                self.drain(&mut out).await?;
                Ok(out)
            }
            Command::Purge { collection, owner } => {
                let removed = self
                    .db
                    .store()
                    .delete_where(&collection, OwnerRole::Owner, &owner)
                    .await?;
                let mut out = format!(
                    "purged {} {} records of {} (counters untouched)",
                    removed.len(),
                    collection,
                    owner
                );
                self.drain(&mut out).await?;
                Ok(out)
            }
            Command::Report { entity } => {
                let readings = self.db.inspect(&entity).await?;
                let mut out = format!("{}:", entity);
                for reading in readings.iter().filter(|r| r.stored != 0 || r.actual != 0) {
                    let _ = write!(
                        out,
                        "\n  {:<24} stored {:>4}  true {:>4}{}",
                        reading.field.as_str(),
                        reading.stored,
                        reading.actual,
                        if reading.is_consistent() { "" } else { "  DRIFT" }
                    );
                }
                Ok(out)
            }
            Command::Reconcile { repair } => {
                let mode = if repair {
                    RepairMode::Repair
                } else {
                    RepairMode::ReportOnly
                };
                let reports = self.db.detector().reconcile_all(mode).await?;
                let mut out = String::new();
                for report in &reports {
                    let _ = writeln!(
                        out,
                        "{}: checked {}, mismatched {}, repaired {}",
                        report.field,
                        report.checked,
                        report.mismatches.len(),
                        report.repaired.len()
                    );
                    for drift in &report.mismatches {
                        let _ = writeln!(
                            out,
                            "  {} stored {} true {}",
                            drift.owner, drift.stored, drift.actual
                        );
                    }
                }
                Ok(out.trim_end().to_string())
            }
            Command::Fail { point, count } => {
                self.db.faults().fail_next(point, count)?;
                Ok(format!("next {} hit(s) of {} will fail", count, point))
            }
            Command::Pipeline(kind) => {
                self.kind = kind;
                self.pipeline = self.db.pipeline(kind);
                let mut out = format!("using {} pipeline", kind);
                if kind == PipelineKind::EventDriven {
                    let feed = &self.db.config().feed;
                    let _ = write!(
                        out,
                        " (feed {}, retention {})",
                        if feed.assume_durable { "assumed durable" } else { "may drop events" },
                        feed.retention
                            .map(|n| n.to_string())
                            .unwrap_or_else(|| "unbounded".to_string())
                    );
                }
                Ok(out)
            }
            Command::Help => Ok(HELP.to_string()),
        }
    }

    /// Subscribe the listener once the event pipeline is in use. Without a saved checkpoint it
    /// starts at the current head: earlier changes were counted by another pipeline.
    async fn attach(&mut self) -> Result<()> {
        if self.kind != PipelineKind::EventDriven || self.subscription.is_some() {
            return Ok(());
        }
        let mut subscription = self.listener.subscription(self.db.feed()).await?;
        if subscription.checkpoint() == Checkpoint::BEGINNING {
            subscription.seek(self.db.feed().head().await);
        }
        self.subscription = Some(subscription);
        Ok(())
    }

    /// Let the listener catch up when counters are maintained from the feed.
    async fn drain(&mut self, out: &mut String) -> Result<()> {
        if self.kind != PipelineKind::EventDriven {
            return Ok(());
        }
        let Some(subscription) = self.subscription.as_mut() else {
            return Ok(());
        };
        let report = self.listener.catch_up(subscription).await?;
        let _ = write!(out, "; listener applied {}", report.applied);
        if report.missed() > 0 {
            let _ = write!(out, ", missed {} event(s)", report.missed());
        }
        Ok(())
    }
}

fn describe(id: Option<DetailId>) -> String {
    id.map(|id| id.to_string())
        .unwrap_or_else(|| "already recorded".to_string())
}

/// Counter values after the concrete drift scenario.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScenarioReport {
    pub likes: usize,
    pub faults: usize,
    /// Like records for the user after the dual-write run.
    pub details: u64,
    /// Stored `number_of_posts_liked` after the dual-write run.
    pub stored: i64,
    /// On-demand count after the same likes through the detail-only pipeline.
    pub on_demand: u64,
}

impl ScenarioReport {
    pub fn drifted(&self) -> bool {
        self.stored != self.details as i64
    }
}

impl fmt::Display for ScenarioReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "dual-write: {} concurrent likes, {} failed aggregate write(s)",
            self.likes, self.faults
        )?;
        writeln!(
            f,
            "  like records {}  number_of_posts_liked {}{}",
            self.details,
            self.stored,
            if self.drifted() { "  DRIFT" } else { "" }
        )?;
        write!(f, "on-demand: count {}", self.on_demand)
    }
}

/// `likes` concurrent likes of distinct posts by one user through the unprotected dual write,
/// with the first `faults` aggregate writes failing, then the same likes through the
/// on-demand design.
pub async fn run_scenario(likes: usize, faults: usize) -> Result<ScenarioReport> {
    let user = EntityId::from("U");
    let field = "number_of_posts_liked";
    let config = TallyConfig::default().counters(vec![CounterSpec::new(
        field,
        LIKES,
        OwnerRole::Owner,
    )]);
    let posts: Vec<String> = (1..=likes).map(|n| format!("post-{}", n)).collect();

    let db = TallyDb::open(config.clone())?;
    db.faults().fail_next(FaultPoint::AggregateWrite, faults)?;
    let dual_write = db.dual_write();
    join_all(
        posts
            .iter()
            .map(|post| dual_write.create(NewDetail::like(user.clone(), post.as_str()))),
    )
    .await;
    let details = db.store().count_where(LIKES, OwnerRole::Owner, &user).await?;
    let stored = db
        .store()
        .read_aggregate(&AggregateKey::new(user.clone(), field))
        .await?;

    let db = TallyDb::open(config)?;
    db.faults().fail_next(FaultPoint::AggregateWrite, faults)?;
    let on_demand = db.on_demand();
    for outcome in join_all(
        posts
            .iter()
            .map(|post| on_demand.create(NewDetail::like(user.clone(), post.as_str()))),
    )
    .await
    {
        outcome?;
    }
    let count = db.counter().count(&field.into(), &user).await?;

    Ok(ScenarioReport {
        likes,
        faults,
        details,
        stored,
        on_demand: count,
    })
}
