//! Reporting over the catalog and the container runtime
//!
//! Image listings are derived purely from the catalog snapshot; only the
//! container reporter talks to the runtime.

use serde::Serialize;
use std::sync::Arc;

use crate::catalog::Catalog;
use crate::driver::{ActiveContainer, ContainerDriver, ContainerLogs, DriverError};

/// One declared image and the enabled programs that use it.
#[derive(Debug, Clone, Serialize)]
pub struct ImageUsage {
    pub image: String,
    pub programs: Vec<String>,
    pub is_default: bool,
}

/// Derives the declared-image listing from the catalog. Never inspects
/// the runtime.
pub struct ImageReporter {
    catalog: Arc<Catalog>,
}

impl ImageReporter {
    pub fn new(catalog: Arc<Catalog>) -> Self {
        Self { catalog }
    }

    /// One entry per distinct image referenced by an enabled non-compose
    /// program, plus the default image, in declaration order.
    pub fn images(&self) -> Vec<ImageUsage> {
        let snapshot = self.catalog.snapshot();
        let settings = snapshot.settings();

        let mut usages = vec![ImageUsage {
            image: settings.default_image.clone(),
            programs: Vec::new(),
            is_default: true,
        }];

        for program in snapshot.programs() {
            if !program.enabled || program.is_compose() {
                continue;
            }
            let image = program
                .image
                .clone()
                .unwrap_or_else(|| settings.default_image.clone());
            match usages.iter_mut().find(|usage| usage.image == image) {
                Some(usage) => usage.programs.push(program.id.clone()),
                None => usages.push(ImageUsage {
                    image,
                    programs: vec![program.id.clone()],
                    is_default: false,
                }),
            }
        }

        usages
    }
}

/// Passthrough over the runtime's active containers and their logs.
pub struct ContainerReporter {
    driver: Arc<dyn ContainerDriver>,
}

impl ContainerReporter {
    pub fn new(driver: Arc<dyn ContainerDriver>) -> Self {
        Self { driver }
    }

    pub async fn active(&self) -> Result<Vec<ActiveContainer>, DriverError> {
        self.driver.list_active().await
    }

    /// Logs of running containers matching `image` exactly
    /// (repository:tag).
    pub async fn logs(&self, image: &str) -> Result<Vec<ContainerLogs>, DriverError> {
        self.driver.logs_for_image(image).await
    }
}
