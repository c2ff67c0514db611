use super::ControlKind;
use crate::error::{BotError, BotResult};
use image::GrayImage;
use std::collections::HashMap;
use std::path::Path;

/// Reference images, one per `ControlKind`, in grayscale.
#[derive(Debug, Clone, Default)]
pub struct TemplateSet {
    templates: HashMap<ControlKind, GrayImage>,
}

impl TemplateSet {
    /// Load `<dir>/<template-id>.png` for every control kind.
    /// A missing or unreadable template is a startup configuration error.
    pub fn load(dir: &Path) -> BotResult<Self> {
        let mut templates = HashMap::new();
        let mut missing = Vec::new();
        for kind in ControlKind::ALL {
            let path = dir.join(format!("{}.png", kind.template_id()));
            match image::open(&path) {
                Ok(img) => {
                    templates.insert(kind, img.to_luma8());
                }
                Err(e) => {
                    tracing::error!(path = %path.display(), error = %e, "template unavailable");
                    missing.push(kind.template_id());
                }
            }
        }
        if !missing.is_empty() {
            return Err(BotError::Config(format!(
                "missing templates in {}: {}",
                dir.display(),
                missing.join(", ")
            )));
        }
        Ok(Self { templates })
    }

    pub fn insert(&mut self, kind: ControlKind, template: GrayImage) {
        self.templates.insert(kind, template);
    }

    pub fn get(&self, kind: ControlKind) -> Option<&GrayImage> {
        self.templates.get(&kind)
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}
