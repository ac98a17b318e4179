use anyhow::Result;
use axum::{
    extract::{Json, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use clap::Parser;
use hf_hub::api::tokio::Api;
use sdrun_core::{
    controlnet::ControlType, image_to_base64_png, load_model, DeviceMap, GenerationRequest,
    LoadOptions, ModelLike, ModelSource, Optimization, OptimizationDType, StableDiffusionVariant,
};
use serde::Serialize;
use std::sync::Arc;
use tokio::{self, net::TcpListener};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

// Define command line arguments
#[derive(Parser, Debug)]
#[command(author, version, about = "sdrun image generation server")]
struct Args {
    /// Hub repo id (optionally `repo@revision`) or local diffusers directory.
    #[arg(long, default_value = "stable-diffusion-v1-5/stable-diffusion-v1-5")]
    model: String,

    /// Model variant, detected from the model when omitted.
    #[arg(long)]
    variant: Option<StableDiffusionVariant>,

    /// Serve a ControlNet-guided pipeline using this ControlNet (repo id or directory).
    #[arg(long)]
    controlnet: Option<String>,

    /// How control images are turned into conditioning maps (canny, raw).
    #[arg(long, default_value = "canny")]
    control_type: ControlType,

    /// Accelerator device: cpu, auto, gpu[:N], cuda[:N] or metal[:N].
    #[arg(long, env = "SDRUN_DEVICE", default_value = "auto")]
    device: DeviceMap,

    /// Load the fp16 weight files in half precision.
    #[arg(long)]
    f16: bool,

    /// Rebuild every sub-model in optimized form after loading, with this precision.
    #[arg(long)]
    optimize: Option<OptimizationDType>,

    /// Use flash attention in the UNet and ControlNet.
    #[arg(long)]
    use_flash_attn: bool,

    /// Host address to bind the server to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Port to bind the server to
    #[arg(long, default_value_t = 8000)]
    port: u16,
}

#[derive(Serialize)]
struct GenerationResponse {
    image: String,
}

// Application state containing the preloaded pipeline.
#[derive(Clone)]
struct AppState(Arc<dyn ModelLike>);

async fn generate_image_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<GenerationRequest>,
) -> impl IntoResponse {
    match generate_image(req, &state).await {
        Ok(img_base64) => Json(GenerationResponse { image: img_base64 }).into_response(),
        Err(e) => {
            error!("Error generating image: {:?}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, format!("Error: {:?}", e)).into_response()
        }
    }
}

async fn health_handler() -> &'static str {
    "ok"
}

/// Runs the preloaded pipeline from `state` on the blocking pool and returns the image as base64.
async fn generate_image(params: GenerationRequest, state: &AppState) -> Result<String> {
    let model = state.0.clone();
    let image = tokio::task::spawn_blocking(move || model.run(params)).await??;
    image_to_base64_png(&image)
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/images/generations", post(generate_image_handler))
        .route("/health", get(health_handler))
        .with_state(Arc::new(state))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let options = LoadOptions {
        variant: args.variant,
        controlnet: args.controlnet.as_deref().map(ModelSource::parse),
        control_type: args.control_type,
        use_f16: args.f16,
        use_flash_attn: args.use_flash_attn,
        optimization: args.optimize.map(|dtype| Optimization {
            dtype,
            use_flash_attn: args.use_flash_attn,
            sliced_attention_size: None,
        }),
        ..LoadOptions::new(ModelSource::parse(&args.model))
    };
    let model = load_model(&options, Api::new()?, args.device).await?;

    // --- Build axum router with shared state ---
    let app = router(AppState(model));

    // --- Start the server ---
    let bind_address = format!("{}:{}", args.host, args.port);
    let listener = TcpListener::bind(&bind_address).await?;
    info!("Started server on {}", listener.local_addr()?);
    axum::serve(listener, app.into_make_service()).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::{to_bytes, Body},
        http::{header, Request},
    };
    use image::DynamicImage;
    use tower::ServiceExt;

    struct SolidColor;

    impl ModelLike for SolidColor {
        fn run(&self, request: GenerationRequest) -> Result<DynamicImage> {
            let params = request.resolve((64, 64))?;
            Ok(DynamicImage::new_rgb8(params.width as u32, params.height as u32))
        }
    }

    #[tokio::test]
    async fn generates_base64_png_from_request() -> Result<()> {
        let state = AppState(Arc::new(SolidColor));
        let request = GenerationRequest {
            width: Some(32),
            height: Some(16),
            ..GenerationRequest::new("a grey square")
        };
        let encoded = generate_image(request, &state).await?;
        assert!(!encoded.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn invalid_request_is_an_error() {
        let state = AppState(Arc::new(SolidColor));
        let request = GenerationRequest {
            width: Some(33),
            ..GenerationRequest::new("x")
        };
        assert!(generate_image(request, &state).await.is_err());
    }

    #[tokio::test]
    async fn health_route_answers_ok() -> Result<()> {
        let app = router(AppState(Arc::new(SolidColor)));
        let response = app
            .oneshot(Request::get("/health").body(Body::empty())?)
            .await?;
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await?;
        assert_eq!(&body[..], b"ok");
        Ok(())
    }

    fn generation(body: &'static str) -> Result<Request<Body>> {
        Ok(Request::post("/v1/images/generations")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body))?)
    }

    #[tokio::test]
    async fn generation_route_returns_json_image() -> Result<()> {
        let app = router(AppState(Arc::new(SolidColor)));
        let response = app
            .oneshot(generation(r#"{"prompt": "a grey square", "width": 32}"#)?)
            .await?;
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await?;
        assert!(body.starts_with(br#"{"image":""#));
        Ok(())
    }

    #[tokio::test]
    async fn failed_generation_is_a_server_error() -> Result<()> {
        let app = router(AppState(Arc::new(SolidColor)));
        let response = app
            .oneshot(generation(r#"{"prompt": "x", "width": 33}"#)?)
            .await?;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = to_bytes(response.into_body(), usize::MAX).await?;
        let body = String::from_utf8_lossy(&body);
        assert!(body.starts_with("Error:"), "{body}");
        assert!(body.contains("multiples of 8, got 33x64"), "{body}");
        Ok(())
    }
}
