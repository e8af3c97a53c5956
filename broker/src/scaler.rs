use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tracing::{info, warn};

use common::{WorkerCategory, WorkerTags};

use crate::config::LaunchSettings;
use crate::error::LaunchError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Market {
    OnDemand,
    Spot,
}

impl fmt::Display for Market {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Market::OnDemand => write!(f, "on-demand"),
            Market::Spot => write!(f, "spot"),
        }
    }
}

/// Pedido de máquinas para el proveedor, ya con todo lo que el worker
/// necesita para arrancar y encontrar al broker.
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchSpec {
    pub market: Market,
    pub count: usize,
    pub image_id: String,
    pub instance_type: String,
    pub subnet_id: String,
    pub iam_role: String,
    /// Único por pedido, para que un reintento del proveedor no duplique máquinas.
    pub client_token: String,
    pub instance_tags: BTreeMap<String, String>,
    pub user_data: String,
}

/// Capacidad de levantar máquinas en algún proveedor.
#[async_trait]
pub trait InstanceLauncher: Send + Sync {
    async fn launch(&self, spec: LaunchSpec) -> Result<(), LaunchError>;
}

/// Launcher sin proveedor: solo deja constancia en el log. Igual rechaza
/// lo que ningún proveedor aceptaría.
#[derive(Debug, Default)]
pub struct LoggingLauncher;

#[async_trait]
impl InstanceLauncher for LoggingLauncher {
    async fn launch(&self, spec: LaunchSpec) -> Result<(), LaunchError> {
        if spec.image_id.is_empty() {
            return Err(LaunchError::Rejected(format!(
                "falta la imagen de los workers (token {})",
                spec.client_token
            )));
        }
        info!(
            "sin proveedor configurado, no se lanzan {} workers {} ({} / {}, token {})",
            spec.count,
            spec.market,
            spec.instance_tags.get("networkId").map(String::as_str).unwrap_or(""),
            spec.instance_tags.get("workerVersion").map(String::as_str).unwrap_or(""),
            spec.client_token
        );
        Ok(())
    }
}

/// Pide máquinas nuevas sin bloquear a quien llama.
///
/// Cada pedido se despacha como tarea aparte en el runtime y un semáforo
/// limita cuántas llamadas al proveedor corren a la vez. Los errores del
/// proveedor se loguean y no vuelven al broker.
pub struct FleetScaler {
    settings: LaunchSettings,
    launcher: Arc<dyn InstanceLauncher>,
    permits: Arc<Semaphore>,
    runtime: Handle,
}

impl FleetScaler {
    pub fn new(
        settings: LaunchSettings,
        launcher: Arc<dyn InstanceLauncher>,
        concurrency: usize,
        runtime: Handle,
    ) -> Self {
        Self {
            settings,
            launcher,
            permits: Arc::new(Semaphore::new(concurrency.max(1))),
            runtime,
        }
    }

    /// Arma un pedido por mercado con cantidad > 0.
    pub fn build_specs(
        &self,
        category: &WorkerCategory,
        tags: &WorkerTags,
        n_on_demand: usize,
        n_spot: usize,
    ) -> Vec<LaunchSpec> {
        [(Market::OnDemand, n_on_demand), (Market::Spot, n_spot)]
            .into_iter()
            .filter(|(_, count)| *count > 0)
            .map(|(market, count)| LaunchSpec {
                market,
                count,
                image_id: self.settings.image_id.clone(),
                instance_type: self.settings.instance_type.clone(),
                subnet_id: self.settings.subnet_id.clone(),
                iam_role: self.settings.iam_role.clone(),
                client_token: uuid::Uuid::new_v4().to_string(),
                instance_tags: self.instance_tags(category, tags),
                user_data: self.user_data(category),
            })
            .collect()
    }

    fn instance_tags(&self, category: &WorkerCategory, tags: &WorkerTags) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("Name".to_string(), "analysis-worker".to_string()),
            ("Project".to_string(), tags.project_id.clone()),
            ("networkId".to_string(), category.graph_id.clone()),
            ("workerVersion".to_string(), category.worker_version.clone()),
            ("group".to_string(), tags.access_group.clone()),
            ("user".to_string(), tags.created_by.clone()),
        ])
    }

    /// Configuración que recibe el worker al arrancar, una clave por línea.
    fn user_data(&self, category: &WorkerCategory) -> String {
        let s = &self.settings;
        [
            ("broker-address", s.public_addr.clone()),
            ("broker-port", s.broker_port.to_string()),
            ("worker-port", s.worker_port.to_string()),
            ("initial-graph-id", category.graph_id.clone()),
            ("worker-version", category.worker_version.clone()),
            ("auto-shutdown", "true".to_string()),
            ("log-group", s.log_group.clone()),
        ]
        .iter()
        .map(|(k, v)| format!("{}={}\n", k, v))
        .collect()
    }

    /// Despacha los pedidos y vuelve enseguida.
    pub fn launch(&self, category: &WorkerCategory, tags: &WorkerTags, n_on_demand: usize, n_spot: usize) {
        for spec in self.build_specs(category, tags, n_on_demand, n_spot) {
            info!("pidiendo {} workers {} para {}", spec.count, spec.market, category);
            let launcher = self.launcher.clone();
            let permits = self.permits.clone();
            let category = category.clone();
            self.runtime.spawn(async move {
                let _permit = match permits.acquire_owned().await {
                    Ok(p) => p,
                    Err(_) => return,
                };
                let (count, market) = (spec.count, spec.market);
                if let Err(e) = launcher.launch(spec).await {
                    warn!("no se pudieron lanzar {} workers {} para {}: {}", count, market, category, e);
                }
            });
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    /// Guarda los pedidos en vez de lanzar nada.
    #[derive(Default)]
    pub(crate) struct RecordingLauncher {
        pub(crate) specs: Mutex<Vec<LaunchSpec>>,
    }

    #[async_trait]
    impl InstanceLauncher for RecordingLauncher {
        async fn launch(&self, spec: LaunchSpec) -> Result<(), LaunchError> {
            self.specs.lock().unwrap().push(spec);
            Ok(())
        }
    }

    /// Falla siempre, pero cuenta los intentos.
    #[derive(Default)]
    struct FailingLauncher {
        attempts: AtomicUsize,
    }

    #[async_trait]
    impl InstanceLauncher for FailingLauncher {
        async fn launch(&self, _spec: LaunchSpec) -> Result<(), LaunchError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(LaunchError::Rejected("sin cupo".to_string()))
        }
    }

    async fn wait_for_attempts(launcher: &FailingLauncher, n: usize) -> usize {
        for _ in 0..100 {
            let attempts = launcher.attempts.load(Ordering::SeqCst);
            if attempts >= n {
                return attempts;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        launcher.attempts.load(Ordering::SeqCst)
    }

    fn settings() -> LaunchSettings {
        LaunchSettings {
            public_addr: "10.1.1.1".to_string(),
            broker_port: 7070,
            worker_port: 7080,
            image_id: "ami-1".to_string(),
            instance_type: "c5.2xlarge".to_string(),
            subnet_id: "subnet-1".to_string(),
            iam_role: "worker-role".to_string(),
            log_group: "workers".to_string(),
        }
    }

    fn tags() -> WorkerTags {
        WorkerTags {
            access_group: "grupo".to_string(),
            created_by: "ana@example.com".to_string(),
            project_id: "p-1".to_string(),
            region_id: "r-1".to_string(),
        }
    }

    pub(crate) async fn wait_for_specs(launcher: &RecordingLauncher, n: usize) -> Vec<LaunchSpec> {
        for _ in 0..100 {
            {
                let specs = launcher.specs.lock().unwrap();
                if specs.len() >= n {
                    return specs.clone();
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        launcher.specs.lock().unwrap().clone()
    }

    #[tokio::test]
    async fn build_specs_arma_un_pedido_por_mercado_con_etiquetas() {
        let scaler = FleetScaler::new(settings(), Arc::new(LoggingLauncher), 2, Handle::current());
        let category = WorkerCategory::new("net-1", "v5.0");

        let specs = scaler.build_specs(&category, &tags(), 1, 0);
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].market, Market::OnDemand);
        assert_eq!(specs[0].instance_tags["networkId"], "net-1");
        assert_eq!(specs[0].instance_tags["user"], "ana@example.com");
        assert!(specs[0].user_data.contains("broker-address=10.1.1.1\n"));
        assert!(specs[0].user_data.contains("initial-graph-id=net-1\n"));
        assert!(specs[0].user_data.contains("auto-shutdown=true\n"));

        let both = scaler.build_specs(&category, &tags(), 2, 3);
        assert_eq!(both.len(), 2);
        assert_eq!((both[1].market, both[1].count), (Market::Spot, 3));
        assert_ne!(both[0].client_token, both[1].client_token);
    }

    #[tokio::test]
    async fn launch_despacha_en_segundo_plano() {
        let launcher = Arc::new(RecordingLauncher::default());
        let scaler = FleetScaler::new(settings(), launcher.clone(), 1, Handle::current());

        scaler.launch(&WorkerCategory::new("net-1", "v5.0"), &tags(), 1, 4);
        let specs = wait_for_specs(&launcher, 2).await;
        assert_eq!(specs.len(), 2);
        assert_eq!(specs.iter().map(|s| s.count).sum::<usize>(), 5);
    }

    #[tokio::test]
    async fn errores_del_proveedor_no_llegan_a_quien_pide() {
        let launcher = Arc::new(FailingLauncher::default());
        let scaler = FleetScaler::new(settings(), launcher.clone(), 1, Handle::current());
        let category = WorkerCategory::new("net-1", "v5.0");

        // launch no devuelve nada: el error del proveedor queda en el log
        scaler.launch(&category, &tags(), 1, 0);
        assert_eq!(wait_for_attempts(&launcher, 1).await, 1);

        // el permiso del semáforo se liberó y el siguiente pedido sale igual
        scaler.launch(&category, &tags(), 0, 2);
        assert_eq!(wait_for_attempts(&launcher, 2).await, 2);
    }

    #[tokio::test]
    async fn logging_launcher_rechaza_pedidos_sin_imagen() {
        let mut sin_imagen = settings();
        sin_imagen.image_id = String::new();
        let scaler = FleetScaler::new(sin_imagen, Arc::new(LoggingLauncher), 1, Handle::current());
        let category = WorkerCategory::new("net-1", "v5.0");

        let spec = scaler.build_specs(&category, &tags(), 1, 0).remove(0);
        assert!(matches!(
            LoggingLauncher.launch(spec).await,
            Err(LaunchError::Rejected(_))
        ));
        let spec = FleetScaler::new(settings(), Arc::new(LoggingLauncher), 1, Handle::current())
            .build_specs(&category, &tags(), 1, 0)
            .remove(0);
        assert!(LoggingLauncher.launch(spec).await.is_ok());
    }
}
