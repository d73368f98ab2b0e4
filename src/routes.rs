use actix_web::web;

use crate::handlers::{health, produce};

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/health", web::get().to(health::health))
        .route("/ready", web::get().to(health::ready))
        .route("/metrics", web::get().to(health::metrics))
        .route(
            "/api/v1/pipeline/stats",
            web::get().to(health::pipeline_stats),
        )
        .service(
            web::scope("/api/v1/kafka")
                .route("/messages", web::post().to(produce::send_message))
                .route("/messages/batch", web::post().to(produce::send_batch))
                .route(
                    "/messages/duplicate-test",
                    web::post().to(produce::duplicate_test),
                ),
        );
}
