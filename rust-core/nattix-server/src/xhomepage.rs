//! The `xhomepage` plugin: an alternative landing page under `/xhomepage`

use nattix_core::kernel::PLUGINS_LOADED_HOOK;
use nattix_core::{
    AppContext, BoxFuture, Controller, ControllerBase, Plugin, Request, Response, Result, Router,
};
use serde_json::Value;
use std::sync::Arc;
use tracing::info;

/// Manifest id this implementation answers to
pub const PLUGIN_ID: &str = "xhomepage";

/// Plugin entry point
pub struct XHomepage;

impl Plugin for XHomepage {
    fn boot(&self, ctx: &AppContext) -> Result<()> {
        ctx.hooks.add(PLUGINS_LOADED_HOOK, |_| {
            info!(plugin = PLUGIN_ID, "Homepage plugin ready");
            Value::Null
        });
        Ok(())
    }

    fn routes(&self, router: &mut Router) -> Result<()> {
        let _ = router
            .controllers_mut()
            .register::<XHomepageController>("XHomepageController")
            .action("index", XHomepageController::index);
        router.get("/xhomepage", ("XHomepageController", "index"))?;
        Ok(())
    }
}

/// Controller behind the plugin's routes
pub struct XHomepageController {
    base: ControllerBase,
}

impl Controller for XHomepageController {
    fn create(ctx: Arc<AppContext>) -> Result<Self> {
        Ok(Self {
            base: ControllerBase::new(&ctx),
        })
    }

    fn base(&self) -> &ControllerBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut ControllerBase {
        &mut self.base
    }

    fn on_construct(&mut self) {
        self.base
            .view
            .add_stylesheet("assets/css/style.css")
            .add_script("assets/js/scripts.js");
    }
}

impl XHomepageController {
    fn index(mut self, _req: Request, _res: Response) -> BoxFuture<'static, Result<Response>> {
        Box::pin(async move {
            self.base
                .view
                .assign("title", "Natti-X homepage")
                .assign("view", serde_json::json!({}));
            Ok(Response::html(self.base.view.render("welcome")?))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nattix_core::{Config, Kernel, Method};
    use std::collections::HashMap;
    use std::fs;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_plugin_loads_from_manifest_and_serves_route() {
        let dir = TempDir::new().unwrap();
        let plugin_dir = dir.path().join("plugins").join("xhomepage");
        fs::create_dir_all(&plugin_dir).unwrap();
        fs::write(
            plugin_dir.join("install.json"),
            r#"{"active": true, "name": "XHomepage", "author": "Nattix", "version": "1.0.0",
                "id": "xhomepage", "index": 1, "routes": true}"#,
        )
        .unwrap();
        let templates = dir.path().join("templates");
        fs::create_dir_all(&templates).unwrap();
        fs::write(templates.join("welcome.html"), "<h1>{{title}}</h1>").unwrap();

        let mut kernel = Kernel::new(AppContext::new(dir.path(), Config::new()));
        kernel.plugins_mut().register(PLUGIN_ID, XHomepage);
        let loaded = kernel.load_plugins().unwrap();
        assert_eq!(loaded.len(), 1);

        let res = kernel
            .handle(Request::new(Method::Get, "/xhomepage", HashMap::new(), None))
            .await;
        assert_eq!(res.status, 200);
        assert_eq!(res.body, "<h1>Natti-X homepage</h1>");
    }
}
