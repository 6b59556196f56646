use std::path::PathBuf;
use thiserror::Error;

use crate::config::ModelProfile;
use crate::device::{DeviceError, ManualCommand, PlotParams, PlotterDriver, RunRequest};

#[derive(Debug, Error)]
pub enum JobError {
    #[error("plot source not found: {0:?}")]
    SourceMissing(PathBuf),
    #[error("failed to prepare plot job: {0}")]
    Setup(#[source] DeviceError),
    #[error("plot run failed: {0}")]
    Run(#[source] DeviceError),
}

/// Lifecycle of one plot request. Transitions are strictly sequential; there
/// is no path back from a later state to an earlier one and no retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Pending,
    Configuring,
    Running,
    PoweringDown,
    Done,
    Failed,
}

/// A single plot request executed end-to-end under the device gate.
///
/// Owned by the handling task; created per request and dropped with it.
pub struct PlotJob {
    source: PathBuf,
    /// 0 plots every layer; a positive value selects that single layer.
    layer: u32,
    profile: ModelProfile,
    state: JobState,
}

impl PlotJob {
    pub fn new(source: PathBuf, layer: u32, profile: ModelProfile) -> Self {
        Self {
            source,
            layer,
            profile,
            state: JobState::Pending,
        }
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    /// Run the job to completion, returning the layer that was executed.
    ///
    /// The caller must hold the device gate for the whole call. However the
    /// run goes, once the session was opened the motors are de-energized
    /// before this returns.
    pub async fn execute(&mut self, driver: &dyn PlotterDriver) -> Result<u32, JobError> {
        self.state = JobState::Configuring;

        if !tokio::fs::try_exists(&self.source).await.unwrap_or(false) {
            self.state = JobState::Failed;
            return Err(JobError::SourceMissing(self.source.clone()));
        }

        let request = RunRequest::Plot(PlotParams {
            source: self.source.clone(),
            layer: self.layer,
            profile: self.profile.clone(),
            clip_to_travel: true,
        });

        if self.layer > 0 {
            tracing::info!("Plotting {} (layer {})", self.source.display(), self.layer);
        } else {
            tracing::info!("Plotting {} (all layers)", self.source.display());
        }

        if let Err(e) = driver.open().await {
            self.state = JobState::Failed;
            return Err(JobError::Setup(e));
        }

        self.state = JobState::Running;
        let outcome = driver.configure_and_run(&request).await;

        // The session is open whatever the run outcome was: de-energize the
        // axes before reporting anything.
        self.state = JobState::PoweringDown;
        self.power_down(driver).await;

        match outcome {
            Ok(()) => {
                self.state = JobState::Done;
                tracing::info!("Plot complete: {}", self.source.display());
                Ok(self.layer)
            }
            Err(e) => {
                self.state = JobState::Failed;
                Err(JobError::Run(e))
            }
        }
    }

    /// Best-effort power-down: failures here are logged, never surfaced over
    /// a prior run failure.
    async fn power_down(&self, driver: &dyn PlotterDriver) {
        if let Err(e) = driver
            .configure_and_run(&RunRequest::Manual(ManualCommand::DisableMotors))
            .await
        {
            tracing::warn!("Failed to disable motors after plot: {}", e);
        }
        if let Err(e) = driver.close().await {
            tracing::warn!("Failed to close plotter session after plot: {}", e);
        }
    }
}
