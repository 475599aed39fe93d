use actix_web::web;
use crate::web::handlers;

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/v1")
            .route("/chat", web::post().to(handlers::chat_api))
            .route("/logs/{conversation_id}", web::get().to(handlers::get_log))
            .route("/logs/{conversation_id}", web::put().to(handlers::update_log))
            .route("/feedback", web::post().to(handlers::feedback))
            .service(
                web::scope("/admin")
                    .route("/logs", web::get().to(handlers::admin_list_logs))
                    .route("/logs/{conversation_id}", web::delete().to(handlers::admin_delete_log))
                    .route("/bans", web::get().to(handlers::admin_list_bans))
                    .route("/bans", web::delete().to(handlers::admin_clear_bans))
                    .route("/bans/{client_address}", web::delete().to(handlers::admin_unban)),
            ),
    )
    .route("/", web::get().to(handlers::index))
    .route("/chat", web::post().to(handlers::chat_form))
    .route("/health", web::get().to(handlers::health_check));
}
