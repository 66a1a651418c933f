use std::collections::HashMap;
use std::fmt::Display;
use std::str::FromStr;

use tokio::sync::watch;
use tracing::{debug, info};

use tether_pipeline::{Context, OpId, OpKind, Operation, PipelineError, Stage};

/// A subscribable hub capability
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Feature {
    C2d,
    Input,
    Methods,
    Twin,
    TwinPatches,
}

impl Feature {
    pub const ALL: [Feature; 5] = [
        Feature::C2d,
        Feature::Input,
        Feature::Methods,
        Feature::Twin,
        Feature::TwinPatches,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Feature::C2d => "c2d",
            Feature::Input => "input",
            Feature::Methods => "methods",
            Feature::Twin => "twin",
            Feature::TwinPatches => "twin_patches",
        }
    }
}

impl Display for Feature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Feature {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Feature::ALL
            .into_iter()
            .find(|f| f.as_str() == s)
            .ok_or_else(|| PipelineError::Protocol(format!("unknown feature {s}")))
    }
}

/// Which features are currently enabled
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FeatureTable(HashMap<Feature, bool>);

impl FeatureTable {
    pub fn is_enabled(&self, feature: Feature) -> bool {
        self.0.get(&feature).copied().unwrap_or(false)
    }

    fn set(&mut self, feature: Feature, enabled: bool) {
        self.0.insert(feature, enabled);
    }
}

/// Owns the feature table
///
/// Enable and disable requests are forwarded down, and the table only
/// changes once they succeed. The table is published to the client through
/// a watch channel after each change.
pub struct FeatureStage {
    table: FeatureTable,
    table_tx: watch::Sender<FeatureTable>,

    /// Caller operations by the id of the operation sent in their place
    waiting: HashMap<OpId, (Operation, Feature, bool)>,
}

impl FeatureStage {
    pub fn new() -> (Self, watch::Receiver<FeatureTable>) {
        let (table_tx, table_rx) = watch::channel(FeatureTable::default());
        let stage = Self {
            table: FeatureTable::default(),
            table_tx,
            waiting: HashMap::new(),
        };
        (stage, table_rx)
    }

    fn toggle(&mut self, ctx: &mut Context<'_>, op: Operation, name: String, enable: bool) {
        let feature = match name.parse::<Feature>() {
            Ok(feature) => feature,
            Err(err) => return ctx.complete(op, Err(err)),
        };

        let kind = if enable {
            OpKind::EnableFeature { feature: name }
        } else {
            OpKind::DisableFeature { feature: name }
        };
        let forwarded = Operation::new(kind);
        self.waiting.insert(forwarded.id(), (op, feature, enable));
        ctx.send_op_down_tracked(forwarded, 0);
    }
}

impl Stage for FeatureStage {
    fn name(&self) -> &'static str {
        "FeatureStage"
    }

    fn run_op(&mut self, ctx: &mut Context<'_>, op: Operation) {
        match &op.kind {
            OpKind::EnableFeature { feature } => {
                let name = feature.clone();
                self.toggle(ctx, op, name, true);
            }
            OpKind::DisableFeature { feature } => {
                let name = feature.clone();
                self.toggle(ctx, op, name, false);
            }
            _ => ctx.send_op_down(op),
        }
    }

    fn on_op_complete(&mut self, ctx: &mut Context<'_>, mut forwarded: Operation, _: u64) {
        let Some((original, feature, enable)) = self.waiting.remove(&forwarded.id()) else {
            return;
        };

        match forwarded.error.take() {
            None => {
                info!(%feature, enabled = enable, "feature changed");
                self.table.set(feature, enable);
                self.table_tx.send_replace(self.table.clone());
                ctx.complete(original, Ok(()));
            }
            Some(err) => {
                debug!(%feature, "feature left unchanged: {err}");
                ctx.complete(original, Err(err));
            }
        }
    }
}
