use serde::Deserialize;
use std::error::Error;
use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::SystemTime;
use log::info;

use crate::models::chat::Persona;

const DEFAULT_SYSTEM_INSTRUCTION: &str =
    "أنت المساعد الأكاديمي الرسمي لجامعة 21 سبتمبر للعلوم الطبية والتطبيقية. أجب باللغة العربية بدقة وموضوعية عن الأسئلة الطبية والأكاديمية، واعتمد على المصادر الموثوقة في إجاباتك، ووضح عند الحاجة أن المعلومات الطبية لا تغني عن استشارة مختص.";

const DEFAULT_ADVISOR_SUFFIX: &str =
    "\n\n ركز بشكل خاص على: شروط القبول، المعدلات، التكاليف الدراسية، والخطط الدراسية. تصرف كمرشد أكاديمي خبير.";

const DEFAULT_GREETING_GENERAL: &str =
    "مرحباً بك في الإصدار Pro Ultra. اسألني عن أي موضوع طبي معقد أو بحث أكاديمي، وسأستخدم قدرات الاستدلال المتقدمة لمساعدتك.";

const DEFAULT_GREETING_ADVISOR: &str =
    "أهلاً بك في قسم الإرشاد الأكاديمي. أنا هنا لمساعدتك في إجراءات القبول، اختيار التخصص، واللوائح الجامعية. كيف يمكنني توجيهك اليوم؟";

const DEFAULT_NEWS_PROMPT: &str =
    "استخرج آخر 4 أخبار أو إعلانات رسمية هامة من موقع جامعة 21 سبتمبر (https://21umas.edu.ye/). ركز على الأخبار الحديثة جداً (2024/2025). نسق الرد كنقاط موجزة.";

const DEFAULT_NEWS_INSTRUCTION: &str =
    "أنت مراسل صحفي لجامعة 21 سبتمبر. مهمتك جلب الأخبار بدقة من الموقع الرسمي فقط.";

const DEFAULT_VISION_PREFIX: &str = "بصفتك خبيراً أكاديمياً وطبياً في جامعة 21 سبتمبر: ";

const DEFAULT_CHAT_FALLBACK: &str = "عذراً، لم أستطع تكوين إجابة. يرجى إعادة الصياغة.";
const DEFAULT_CHAT_ERROR: &str = "حدث خطأ غير متوقع في النظام. يرجى التحقق من الاتصال.";
const DEFAULT_NEWS_FALLBACK: &str = "عذراً، لم أتمكن من الوصول لآخر الأخبار حالياً.";
const DEFAULT_NEWS_ERROR: &str = "تعذر الاتصال بخادم الأخبار. يرجى المحاولة لاحقاً.";
const DEFAULT_VISION_FALLBACK: &str = "فشل تحليل الصورة.";
const DEFAULT_VISION_ERROR: &str = "حدث خطأ أثناء معالجة الصورة. تأكد من أن الصورة واضحة.";

#[derive(Debug)]
pub enum PromptError {
    IoError(std::io::Error),
    JsonError(serde_json::Error),
}

impl fmt::Display for PromptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PromptError::IoError(e) => write!(f, "Prompt file IO error: {}", e),
            PromptError::JsonError(e) => write!(f, "Prompt JSON parsing error: {}", e),
        }
    }
}

impl Error for PromptError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            PromptError::IoError(e) => Some(e),
            PromptError::JsonError(e) => Some(e),
        }
    }
}

impl From<std::io::Error> for PromptError {
    fn from(err: std::io::Error) -> Self {
        PromptError::IoError(err)
    }
}

impl From<serde_json::Error> for PromptError {
    fn from(err: serde_json::Error) -> Self {
        PromptError::JsonError(err)
    }
}

/// Every operator-tunable string the assistant speaks or instructs with.
/// Built-in defaults cover the full set; a prompts file may override any
/// subset of them.
#[derive(Debug, Clone)]
pub struct PersonaPrompts {
    pub system_instruction: String,
    pub advisor_suffix: String,
    pub greeting_general: String,
    pub greeting_advisor: String,
    pub news_prompt: String,
    pub news_instruction: String,
    pub vision_prefix: String,
    pub chat_fallback: String,
    pub chat_error: String,
    pub news_fallback: String,
    pub news_error: String,
    pub vision_fallback: String,
    pub vision_error: String,
    pub last_loaded: Option<SystemTime>,
}

impl Default for PersonaPrompts {
    fn default() -> Self {
        Self {
            system_instruction: DEFAULT_SYSTEM_INSTRUCTION.to_string(),
            advisor_suffix: DEFAULT_ADVISOR_SUFFIX.to_string(),
            greeting_general: DEFAULT_GREETING_GENERAL.to_string(),
            greeting_advisor: DEFAULT_GREETING_ADVISOR.to_string(),
            news_prompt: DEFAULT_NEWS_PROMPT.to_string(),
            news_instruction: DEFAULT_NEWS_INSTRUCTION.to_string(),
            vision_prefix: DEFAULT_VISION_PREFIX.to_string(),
            chat_fallback: DEFAULT_CHAT_FALLBACK.to_string(),
            chat_error: DEFAULT_CHAT_ERROR.to_string(),
            news_fallback: DEFAULT_NEWS_FALLBACK.to_string(),
            news_error: DEFAULT_NEWS_ERROR.to_string(),
            vision_fallback: DEFAULT_VISION_FALLBACK.to_string(),
            vision_error: DEFAULT_VISION_ERROR.to_string(),
            last_loaded: None,
        }
    }
}

impl PersonaPrompts {
    pub fn greeting(&self, persona: Persona) -> &str {
        match persona {
            Persona::General => &self.greeting_general,
            Persona::Advisor => &self.greeting_advisor,
        }
    }

    /// System instruction for a chat turn. The advisor persona extends the
    /// base instruction with the admission-guidance focus.
    pub fn system_instruction_for(&self, persona: Persona) -> String {
        match persona {
            Persona::General => self.system_instruction.clone(),
            Persona::Advisor =>
                format!("{}{}", self.system_instruction, self.advisor_suffix),
        }
    }

    fn apply(&mut self, overrides: PromptOverrides) {
        if let Some(v) = overrides.system_instruction {
            self.system_instruction = v;
        }
        if let Some(v) = overrides.advisor_suffix {
            self.advisor_suffix = v;
        }
        if let Some(v) = overrides.greeting_general {
            self.greeting_general = v;
        }
        if let Some(v) = overrides.greeting_advisor {
            self.greeting_advisor = v;
        }
        if let Some(v) = overrides.news_prompt {
            self.news_prompt = v;
        }
        if let Some(v) = overrides.news_instruction {
            self.news_instruction = v;
        }
        if let Some(v) = overrides.vision_prefix {
            self.vision_prefix = v;
        }
        if let Some(v) = overrides.chat_fallback {
            self.chat_fallback = v;
        }
        if let Some(v) = overrides.chat_error {
            self.chat_error = v;
        }
        if let Some(v) = overrides.news_fallback {
            self.news_fallback = v;
        }
        if let Some(v) = overrides.news_error {
            self.news_error = v;
        }
        if let Some(v) = overrides.vision_fallback {
            self.vision_fallback = v;
        }
        if let Some(v) = overrides.vision_error {
            self.vision_error = v;
        }
    }
}

/// Subset of [`PersonaPrompts`] fields a prompts file may override.
#[derive(Deserialize, Debug, Default)]
pub struct PromptOverrides {
    pub system_instruction: Option<String>,
    pub advisor_suffix: Option<String>,
    pub greeting_general: Option<String>,
    pub greeting_advisor: Option<String>,
    pub news_prompt: Option<String>,
    pub news_instruction: Option<String>,
    pub vision_prefix: Option<String>,
    pub chat_fallback: Option<String>,
    pub chat_error: Option<String>,
    pub news_fallback: Option<String>,
    pub news_error: Option<String>,
    pub vision_fallback: Option<String>,
    pub vision_error: Option<String>,
}

pub fn load_prompts(path: &str) -> Result<Arc<PersonaPrompts>, PromptError> {
    let file_content = fs::read_to_string(path)?;
    let overrides: PromptOverrides = serde_json::from_str(&file_content)?;
    let mut prompts = PersonaPrompts::default();
    prompts.apply(overrides);
    prompts.last_loaded = Some(SystemTime::now());
    info!("Loaded prompt overrides from '{}'", path);
    Ok(Arc::new(prompts))
}

pub fn reload_prompts_if_changed<P: AsRef<Path>>(
    path: P,
    current: &Arc<PersonaPrompts>
) -> Result<Option<Arc<PersonaPrompts>>, PromptError> {
    let metadata = fs::metadata(&path)?;

    if let Ok(modified) = metadata.modified() {
        if let Some(last_loaded) = current.last_loaded {
            if modified > last_loaded {
                info!("Prompts file changed, reloading...");
                let new_prompts = load_prompts(path.as_ref().to_str().unwrap_or_default())?;
                return Ok(Some(new_prompts));
            }
        } else {
            info!("No last_loaded timestamp, reloading prompts...");
            let new_prompts = load_prompts(path.as_ref().to_str().unwrap_or_default())?;
            return Ok(Some(new_prompts));
        }
    }
    Ok(None)
}
