use clap::Parser;
use serde::Serialize;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "train",
    about = "DAMNets - Domain Adaptive Multibranch Networks"
)]
pub struct TrainArgs {
    /// Define the source domain.
    #[arg(short, long, default_value = "MNIST")]
    pub source: String,
    /// Define the target domain.
    #[arg(short, long, default_value = "MNIST_M")]
    pub target: String,
    /// Define DAMNet model.
    #[arg(short, long, default_value = "MultibranchLeNet")]
    pub model: String,
}

/// What to train, resolved once from the command line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunSelection {
    pub source: String,
    pub target: String,
    pub model: String,
}

impl RunSelection {
    pub fn new(
        source: impl Into<String>,
        target: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            model: model.into(),
        }
    }

    /// Key/value pairs in flag order, for the startup banner.
    pub fn entries(&self) -> [(&'static str, &str); 3] {
        [
            ("source", self.source.as_str()),
            ("target", self.target.as_str()),
            ("model", self.model.as_str()),
        ]
    }
}

impl From<TrainArgs> for RunSelection {
    fn from(args: TrainArgs) -> Self {
        RunSelection::new(args.source, args.target, args.model)
    }
}
