//! Global problem assembly.

use crate::core_api::CoreApi;
use crate::devices::{self, EnabledKinds, ExclusivityGuard, PlannedSeries};
use crate::domain::{Horizon, ThermalModel, TimeSeries};
use crate::error::ControlError;
use good_lp::{constraint, Constraint, Expression, ProblemVariables};
use tracing::info;

pub const NON_CONTROLLABLE_VARIABLE: &str = "non-controllable-loads";

/// The assembled optimization problem, ready to solve.
pub struct BuiltPlan {
    pub horizon: Horizon,
    pub vars: ProblemVariables,
    pub objective: Expression,
    pub constraints: Vec<Constraint>,
    pub series: Vec<PlannedSeries>,
    pub guards: Vec<ExclusivityGuard>,
    /// Net grid exchange per step, kW.
    pub net_kw: Vec<Expression>,
    pub price: Vec<f64>,
    pub limit_kw: Vec<f64>,
    pub non_controllable_kw: Vec<f64>,
    pub model_count: usize,
    pub has_binaries: bool,
}

impl std::fmt::Debug for BuiltPlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuiltPlan")
            .field("horizon", &self.horizon)
            .field("objective", &self.objective)
            .field("constraints", &self.constraints)
            .field("series", &self.series)
            .field("guards", &self.guards)
            .field("net_kw", &self.net_kw)
            .field("price", &self.price)
            .field("limit_kw", &self.limit_kw)
            .field("non_controllable_kw", &self.non_controllable_kw)
            .field("model_count", &self.model_count)
            .field("has_binaries", &self.has_binaries)
            .finish()
    }
}

/// Build the global program:
///
/// 1. validate the horizon alignment of the request profiles,
/// 2. fetch the non-controllable load forecast,
/// 3. collect objective terms, constraints and dispatch expressions from
///    every enabled sub-model,
/// 4. form the net exchange, the per-step grid-limit constraints and the
///    energy cost,
/// 5. sum cost and comfort into the objective.
pub async fn build(
    api: &dyn CoreApi,
    horizon: &Horizon,
    price_profile: &TimeSeries,
    power_limit: &TimeSeries,
    enabled: &EnabledKinds,
    thermal: Option<&ThermalModel>,
) -> Result<BuiltPlan, ControlError> {
    let n = horizon.steps();
    let dt = horizon.dt_hours();

    // The request must carry aligned profiles; a gap is a bad request,
    // not missing upstream data.
    let price = price_profile
        .dense(horizon, "price profile")
        .map_err(|e| ControlError::HorizonInvalid(e.to_string()))?;
    let limit_kw = power_limit
        .dense(horizon, "power limit")
        .map_err(|e| ControlError::HorizonInvalid(e.to_string()))?;

    let non_controllable_kw = api
        .non_controllable_forecast(NON_CONTROLLABLE_VARIABLE, horizon.start, horizon.stop)
        .await?
        .dense(horizon, "non-controllable load forecast")?;

    let inventory = api.devices().await?;
    let models = devices::retrieve_models(api, &inventory, horizon, enabled, thermal).await?;

    let mut vars = ProblemVariables::new();
    let mut constraints = Vec::new();
    let mut comfort = Expression::from_other_affine(0.0);
    let mut series = Vec::new();
    let mut guards = Vec::new();
    let mut has_binaries = false;
    let mut net_kw: Vec<Expression> = non_controllable_kw
        .iter()
        .map(|su| Expression::from_other_affine(*su))
        .collect();

    let model_count = models.len();
    for model in &models {
        info!(kind = model.kind().as_str(), "formulating device sub-model");
        let formulation = model.formulate(horizon, &mut vars)?;
        comfort += formulation.comfort;
        constraints.extend(formulation.constraints);
        series.extend(formulation.series);
        guards.extend(formulation.guards);
        has_binaries |= formulation.has_binaries;
        for (k, dispatch) in formulation.dispatch_kw.into_iter().enumerate() {
            net_kw[k] += dispatch;
        }
    }

    for k in 0..n {
        constraints.push(constraint!(net_kw[k].clone() <= limit_kw[k]));
    }

    let mut cost = Expression::from_other_affine(0.0);
    for k in 0..n {
        cost += (price[k] * dt) * net_kw[k].clone();
    }
    let objective = cost + comfort;

    info!(
        steps = n,
        models = model_count,
        mixed_integer = has_binaries,
        "global problem assembled"
    );

    Ok(BuiltPlan {
        horizon: *horizon,
        vars,
        objective,
        constraints,
        series,
        guards,
        net_kw,
        price,
        limit_kw,
        non_controllable_kw,
        model_count,
        has_binaries,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Device;
    use async_trait::async_trait;
    use chrono::{DateTime, Duration, TimeZone, Utc};

    /// Minimal fake: no devices, configurable forecast availability.
    struct EmptyInventoryApi {
        forecast: Option<TimeSeries>,
    }

    #[async_trait]
    impl CoreApi for EmptyInventoryApi {
        async fn devices(&self) -> Result<Vec<Device>, ControlError> {
            Ok(Vec::new())
        }
        async fn device_state(&self, _: &str, _: Option<&str>) -> Result<f64, ControlError> {
            Err(ControlError::DataUnavailable("no state".into()))
        }
        async fn building_consumption(&self) -> Result<f64, ControlError> {
            Err(ControlError::DataUnavailable("no meter".into()))
        }
        async fn preferences(
            &self,
            _: &str,
            _: &str,
            _: DateTime<Utc>,
            _: DateTime<Utc>,
        ) -> Result<TimeSeries, ControlError> {
            Err(ControlError::DataUnavailable("no preferences".into()))
        }
        async fn historic(
            &self,
            _: &str,
            _: DateTime<Utc>,
            _: DateTime<Utc>,
            _: Option<&str>,
        ) -> Result<TimeSeries, ControlError> {
            Err(ControlError::DataUnavailable("no historic".into()))
        }
        async fn weather(
            &self,
            _: crate::core_api::WeatherScope,
            _: &str,
            _: DateTime<Utc>,
            _: DateTime<Utc>,
        ) -> Result<TimeSeries, ControlError> {
            Err(ControlError::DataUnavailable("no weather".into()))
        }
        async fn non_controllable_forecast(
            &self,
            _: &str,
            _: DateTime<Utc>,
            _: DateTime<Utc>,
        ) -> Result<TimeSeries, ControlError> {
            self.forecast
                .clone()
                .ok_or_else(|| ControlError::DataUnavailable("forecast down".into()))
        }
        async fn post_setpoint(&self, _: &str, _: f64) -> Result<(), ControlError> {
            Ok(())
        }
        async fn post_schedule(&self, _: i64, _: &serde_json::Value) -> Result<(), ControlError> {
            Ok(())
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 5, 26, 19, 0, 0).unwrap()
    }

    fn grid_series(horizon: &Horizon, value: f64) -> TimeSeries {
        TimeSeries::on_grid(horizon, &vec![value; horizon.steps()])
    }

    #[tokio::test]
    async fn missing_forecast_fails_with_data_unavailable() {
        let horizon = Horizon::new(t0(), t0() + Duration::minutes(10), 10).unwrap();
        let api = EmptyInventoryApi { forecast: None };
        let err = build(
            &api,
            &horizon,
            &grid_series(&horizon, 0.1),
            &grid_series(&horizon, 10.0),
            &EnabledKinds::all(),
            None,
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind(), "DATA_UNAVAILABLE");
    }

    #[tokio::test]
    async fn misaligned_price_profile_is_a_horizon_error() {
        let horizon = Horizon::new(t0(), t0() + Duration::minutes(20), 10).unwrap();
        let api = EmptyInventoryApi {
            forecast: Some(grid_series(&horizon, 2.0)),
        };
        let sparse_price = TimeSeries::from_points([(t0(), 0.1)]);
        let err = build(
            &api,
            &horizon,
            &sparse_price,
            &grid_series(&horizon, 10.0),
            &EnabledKinds::all(),
            None,
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind(), "HORIZON_INVALID");
    }

    #[tokio::test]
    async fn zero_devices_builds_a_constant_plan() {
        let horizon = Horizon::new(t0(), t0() + Duration::minutes(20), 10).unwrap();
        let api = EmptyInventoryApi {
            forecast: Some(grid_series(&horizon, 2.0)),
        };
        let plan = build(
            &api,
            &horizon,
            &grid_series(&horizon, 0.1),
            &grid_series(&horizon, 10.0),
            &EnabledKinds::all(),
            None,
        )
        .await
        .unwrap();
        assert_eq!(plan.model_count, 0);
        assert_eq!(plan.non_controllable_kw, vec![2.0, 2.0]);
        assert!(plan.series.is_empty());
    }
}
