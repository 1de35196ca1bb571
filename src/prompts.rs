//! Prompt builders for the judge, the answer generator, and the
//! hypothetical-answer query rewrite.

use crate::chat::ChatMessage;
use crate::models::Document;

pub const RERANK_SYSTEM_PROMPT: &str = "You are an expert in document relevance assessment.
Your task is to evaluate how well a document answers a user's search query.

Rate its relevance on a scale of 1 to 5:
- 1: Completely irrelevant to the query
- 2: Weakly related to the query
- 3: Partially relevant
- 4: Well-suited to the query
- 5: Perfectly suited to answer the query

Return ONLY a number from 1 to 5, without further explanation.";

pub const ANSWER_SYSTEM_PROMPT: &str = "You are an assistant who answers user questions based on the documents provided.
RULES:
1. Answer only based on the information provided in the documents.
2. If the documents do not answer the question, or no documents are provided, say that you could not find an answer.
3. Answer in the same language in which the question was asked.
4. Be precise and specific.
5. Do not distort facts from the documents when abbreviating or restating them.
6. If there are multiple answers to a question, provide all of them in sufficient detail.
7. You may structure the answer, but do not use markdown or symbols to highlight text.
8. Give only the answer; do not add footnotes naming or numbering the source documents.";

/// Messages asking the judge to rate `document_text` against `query`.
pub fn rerank_messages(query: &str, document_text: &str) -> Vec<ChatMessage> {
    vec![
        ChatMessage::system(RERANK_SYSTEM_PROMPT),
        ChatMessage::user(format!(
            "User query: {}\n\nDocument to evaluate:\n{}\n\nRelevance score (1-5):",
            query, document_text
        )),
    ]
}

/// Messages asking the generator to answer `query` from `documents`.
pub fn answer_messages(query: &str, documents: &[Document]) -> Vec<ChatMessage> {
    vec![
        ChatMessage::system(ANSWER_SYSTEM_PROMPT),
        ChatMessage::user(format!(
            "User question: {}\n\nContext from documents:\n{}\nAnswer:",
            query,
            format_document_context(documents)
        )),
    ]
}

/// Single-message prompt for a HyDE-style rewrite: the model writes a short
/// hypothetical document that answers the question, and that text is
/// searched instead of the question.
pub fn hyde_messages(query: &str) -> Vec<ChatMessage> {
    vec![ChatMessage::user(format!(
        "Given the question \"{}\", write a hypothetical instruction with a title \
         and body that directly answers it. Keep it to about 150 words.",
        query
    ))]
}

/// Serialize documents in ranked order, numbered from 1.
pub fn format_document_context(documents: &[Document]) -> String {
    let mut context = String::new();
    for (i, doc) in documents.iter().enumerate() {
        context.push_str(&format!(
            "\nDocument {}:\nTitle: {}\nURL: {}\nText: {}\n\n",
            i + 1,
            doc.title,
            doc.url,
            doc.text
        ));
    }
    context
}
