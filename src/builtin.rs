//! Plugins bundled with the host.

use std::sync::{Arc, Mutex};

use host_protocol::{plugin::SettingKind, PluginConfig, PluginDescriptor};
use tracing::{debug, info};

use crate::content::{
    page::{ListenerKey, PageHandle},
    session::{Activation, ContentPlugin, NoCleanup},
};

pub fn plugins() -> Vec<Arc<dyn ContentPlugin>> {
    vec![
        Arc::new(CssSpy::new()),
        Arc::new(ImageCollector::new()),
    ]
}

pub fn descriptors() -> Vec<PluginDescriptor> {
    plugins().iter().map(|p| p.descriptor().clone()).collect()
}

// -----------------------------------------------------------------------------
// css-spy
// -----------------------------------------------------------------------------

/// Reports the tag and class of whatever the pointer is over.
pub struct CssSpy {
    descriptor: PluginDescriptor,
    hovered: Arc<Mutex<Option<String>>>,
}

impl CssSpy {
    pub fn new() -> Self {
        Self {
            descriptor: PluginDescriptor::new("css-spy", "CSS Spy")
                .with_description("Inspect element styles under the pointer")
                .with_category("inspect")
                .with_setting("opacity", "Overlay opacity", SettingKind::Number, 0.9)
                .with_setting("showBoxModel", "Show box model", SettingKind::Boolean, true)
                .with_shortcut("toggle", "Toggle the inspector", &["Alt", "C"]),
            hovered: Arc::default(),
        }
    }

    pub fn hovered(&self) -> Option<String> {
        self.hovered.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

struct SpyActivation {
    page: PageHandle,
    listener: ListenerKey,
    hovered: Arc<Mutex<Option<String>>>,
}

impl Activation for SpyActivation {
    fn cleanup(self: Box<Self>) -> anyhow::Result<()> {
        self.page.remove_listener(self.listener);
        *self.hovered.lock().unwrap_or_else(|e| e.into_inner()) = None;
        Ok(())
    }
}

impl ContentPlugin for CssSpy {
    fn descriptor(&self) -> &PluginDescriptor {
        &self.descriptor
    }

    fn activate(&self, page: &PageHandle, config: &PluginConfig) -> anyhow::Result<Box<dyn Activation>> {
        let opacity = config.settings.get("opacity").and_then(|v| v.as_number()).unwrap_or(0.9);
        let hovered = self.hovered.clone();
        let sink = hovered.clone();
        let listener = page.add_listener("mouseover", move |event| {
            if let Some(target) = &event.target {
                let label = match target.get("class") {
                    Some(class) => format!("{}.{}", target.tag, class),
                    None => target.tag.clone(),
                };
                *sink.lock().unwrap_or_else(|e| e.into_inner()) = Some(label);
            }
        });
        debug!("css-spy overlay at opacity {opacity}");
        Ok(Box::new(SpyActivation { page: page.clone(), listener, hovered }))
    }
}

// -----------------------------------------------------------------------------
// image-collector
// -----------------------------------------------------------------------------

/// Lists the page's images at least `minWidth` pixels wide.
pub struct ImageCollector {
    descriptor: PluginDescriptor,
    collected: Arc<Mutex<Vec<String>>>,
}

impl ImageCollector {
    pub fn new() -> Self {
        Self {
            descriptor: PluginDescriptor::new("image-collector", "Image Collector")
                .with_description("Collect and download the images on a page")
                .with_category("assets")
                .with_setting("minWidth", "Minimum width (px)", SettingKind::Number, 64.0)
                .with_setting(
                    "format",
                    "Save as",
                    SettingKind::Enum { options: vec!["original".into(), "png".into()] },
                    "original",
                )
                .with_shortcut("collect", "Collect images", &["Alt", "Shift", "I"])
                .disabled_by_default(),
            collected: Arc::default(),
        }
    }

    pub fn collected(&self) -> Vec<String> {
        self.collected.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl ContentPlugin for ImageCollector {
    fn descriptor(&self) -> &PluginDescriptor {
        &self.descriptor
    }

    fn activate(&self, _page: &PageHandle, _config: &PluginConfig) -> anyhow::Result<Box<dyn Activation>> {
        Ok(Box::new(NoCleanup))
    }

    fn execute(&self, page: &PageHandle, config: &PluginConfig) -> anyhow::Result<()> {
        let min_width = config.settings.get("minWidth").and_then(|v| v.as_number()).unwrap_or(0.0);
        let found: Vec<String> = page
            .query("img")
            .into_iter()
            .filter(|img| {
                img.get("width")
                    .and_then(|w| w.parse::<f64>().ok())
                    .is_none_or(|w| w >= min_width)
            })
            .filter_map(|img| img.get("src").map(str::to_string))
            .collect();
        info!("image-collector found {} images", found.len());
        *self.collected.lock().unwrap_or_else(|e| e.into_inner()) = found;
        Ok(())
    }
}
