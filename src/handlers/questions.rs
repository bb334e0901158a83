use crate::audio::pcm::decode_base64_pcm;
use crate::audio::wav_export::encode_wav;
use crate::error::{AppError, AppResult};
use crate::handlers::request_identity;
use crate::questions::Question;
use crate::state::AppState;
use actix_web::{web, HttpRequest, HttpResponse};
use serde_json::json;

pub async fn list_questions(state: web::Data<AppState>) -> AppResult<HttpResponse> {
    Ok(HttpResponse::Ok().json(json!({
        "total": state.catalog.len(),
        "categories": state.catalog.categories()
    })))
}

fn find_question(state: &AppState, id: &str) -> AppResult<Question> {
    state
        .catalog
        .get(id)
        .cloned()
        .ok_or_else(|| AppError::NotFound(format!("question '{}'", id)))
}

pub async fn get_answer(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> AppResult<HttpResponse> {
    let question = find_question(&state, &path)?;
    let identity = request_identity(&req);

    let entry = state.answers.answer(&identity, &question).await?;

    Ok(HttpResponse::Ok().json(json!({
        "question": question,
        "answer": entry.answer,
        "sources": entry.sources,
        "has_audio": entry.audio_base64.is_some(),
        "updated_at": entry.updated_at.to_rfc3339()
    })))
}

pub async fn get_answer_audio(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> AppResult<HttpResponse> {
    let question = find_question(&state, &path)?;
    let identity = request_identity(&req);
    let sample_rate = state.get_config().audio.output_sample_rate;

    let audio = state.answers.audio(&identity, &question).await?;
    let chunk = decode_base64_pcm(&audio, sample_rate, 0)?;
    let wav = encode_wav(&chunk)?;

    Ok(HttpResponse::Ok()
        .content_type("audio/wav")
        .insert_header((
            "Content-Disposition",
            format!("inline; filename=\"{}.wav\"", question.id),
        ))
        .body(wav))
}
