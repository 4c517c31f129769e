use axum::extract::State;
use fleet_supervisor::{Alarm, ProcessInfo};
use serde::Serialize;

use crate::{error::ApiResult, response::success, state::AppState};

#[derive(Debug, Serialize)]
pub struct SupervisionReport {
    pub processes: Vec<ProcessInfo>,
    pub alarms: Vec<Alarm>,
}

/// 受监督进程状态和告警
pub async fn supervision_report(State(state): State<AppState>) -> ApiResult<SupervisionReport> {
    let report = match &state.supervisor {
        Some(supervisor) => SupervisionReport {
            processes: supervisor.processes().await,
            alarms: supervisor.alarms().await,
        },
        None => SupervisionReport {
            processes: Vec::new(),
            alarms: Vec::new(),
        },
    };
    Ok(success(report))
}
