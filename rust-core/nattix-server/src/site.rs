//! Site controller: welcome pages, a session counter and a small JSON API

use nattix_core::controller::ControllerRegistry;
use nattix_core::{
    json_error_response, json_response, AppContext, BoxFuture, Controller, ControllerBase,
    CookieOptions, Request, Response, Result,
};
use serde_json::json;
use std::sync::Arc;

const USERS_PER_PAGE: u64 = 10;

/// Pages served at the application root
pub struct SiteController {
    base: ControllerBase,
    ctx: Arc<AppContext>,
}

impl Controller for SiteController {
    fn create(ctx: Arc<AppContext>) -> Result<Self> {
        Ok(Self {
            base: ControllerBase::new(&ctx),
            ctx,
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

impl SiteController {
    fn index(mut self, _req: Request, _res: Response) -> BoxFuture<'static, Result<Response>> {
        Box::pin(async move {
            self.base
                .view
                .assign("title", "Welcome")
                .assign("view", json!({ "name": "Nattix", "framework": "MVC" }));
            Ok(Response::html(self.base.view.render("welcome")?))
        })
    }

    fn users(mut self, _req: Request, _res: Response) -> BoxFuture<'static, Result<Response>> {
        Box::pin(async move {
            self.base.view.assign("title", "Users");
            Ok(Response::html(self.base.view.render("welcome")?))
        })
    }

    fn show(self, req: Request, _res: Response) -> BoxFuture<'static, Result<Response>> {
        Box::pin(async move {
            let Some(id) = req.parameter("id").and_then(|id| id.parse::<i64>().ok()) else {
                return Ok(json_error_response(&req, "invalid id", 400));
            };
            let Some(db) = self.ctx.database.as_deref() else {
                return Ok(json_response(&req, &json!({ "id": id }), 200));
            };

            let mut users = db.table("users")?;
            let user = users.select(&[])?.where_eq("id", id)?.first(db).await?;
            match user {
                Some(user) => Ok(json_response(&req, &user, 200)),
                None => Ok(json_error_response(&req, "user not found", 404)),
            }
        })
    }

    fn visits(self, mut req: Request, mut res: Response) -> BoxFuture<'static, Result<Response>> {
        Box::pin(async move {
            let session = self.ctx.sessions.start(&mut req, &mut res);
            let visits = session.get_as::<u64>("visits").unwrap_or(0) + 1;
            session.set("visits", visits);

            if let Some(jar) = &self.ctx.cookies {
                jar.set(&mut res, "visits", &visits.to_string(), &CookieOptions::default())?;
            }

            let mut out = json_response(&req, &json!({ "visits": visits }), 200);
            out.cookies = res.cookies;
            Ok(out)
        })
    }

    fn api_users(self, req: Request, _res: Response) -> BoxFuture<'static, Result<Response>> {
        Box::pin(async move {
            let db = self.ctx.db()?;
            let page = req.get("page", "1").parse::<u64>().unwrap_or(1).max(1);
            let page = db.table("users")?.paginate(db, USERS_PER_PAGE, page).await?;
            Ok(json_response(&req, &page, 200))
        })
    }

    fn me(self, req: Request, _res: Response) -> BoxFuture<'static, Result<Response>> {
        Box::pin(async move {
            let claims = req.claims.clone().unwrap_or_default();
            Ok(json_response(&req, &json!({ "claims": claims }), 200))
        })
    }
}

/// Register the controller and its actions
pub fn register(controllers: &mut ControllerRegistry) {
    let _ = controllers
        .register::<SiteController>("SiteController")
        .action("index", SiteController::index)
        .action("users", SiteController::users)
        .action("show", SiteController::show)
        .action("visits", SiteController::visits)
        .action("api_users", SiteController::api_users)
        .action("me", SiteController::me);
}
