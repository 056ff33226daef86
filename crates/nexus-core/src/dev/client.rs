//! Browser-side runtime and HTML served by the dev server.

/// URL the client runtime is served at.
pub const CLIENT_URL: &str = "/__nexus/client.js";

/// URL of the live-update WebSocket.
pub const WS_URL: &str = "/__nexus/ws";

/// URL of the JSON status endpoint.
pub const STATUS_URL: &str = "/__nexus/status";

/// Prefix every module that touches `import.meta.hot` gets.
#[must_use]
pub fn module_preamble(module_url: &str) -> String {
    let url = serde_json::to_string(module_url).unwrap_or_else(|_| "\"\"".to_string());
    format!(
        "import {{ createHotContext as __nexus_hot__ }} from \"{CLIENT_URL}\";\nimport.meta.hot = __nexus_hot__({url});\n"
    )
}

/// Add the client script to a page, before `</head>` or `</body>`.
#[must_use]
pub fn inject_client(html: &str) -> String {
    if html.contains(CLIENT_URL) {
        return html.to_string();
    }
    let tag = format!("<script type=\"module\" src=\"{CLIENT_URL}\"></script>");
    let mut html = html.to_string();
    if let Some(pos) = html.find("</head>") {
        html.insert_str(pos, &format!("  {tag}\n  "));
    } else if let Some(pos) = html.find("</body>") {
        html.insert_str(pos, &format!("  {tag}\n  "));
    } else {
        html.push('\n');
        html.push_str(&tag);
    }
    html
}

/// Page served when the project has no `index.html`.
#[must_use]
pub fn generate_index_html(entry_url: Option<&str>) -> String {
    let entry = entry_url
        .map(|url| format!("\n    <script type=\"module\" src=\"{url}\"></script>"))
        .unwrap_or_default();
    format!(
        r#"<!DOCTYPE html>
<html lang="en">
  <head>
    <meta charset="UTF-8" />
    <meta name="viewport" content="width=device-width, initial-scale=1.0" />
    <title>nexus</title>
  </head>
  <body>
    <div id="root"></div>{entry}
  </body>
</html>
"#
    )
}

/// The live-update client.
///
/// Provides `import.meta.hot` (`accept`, `dispose`, `data`) and applies
/// `update` frames by re-importing self-accepting modules. Anything else
/// reloads the page.
pub const CLIENT_RUNTIME: &str = r#"// nexus live-update client
const hotModules = new Map();
const disposers = new Map();
const dataMap = new Map();
let generation = 0;
let connected = false;

function isScript(id) {
  return /\.(m|c)?[jt]sx?$/.test(id);
}

function connect() {
  const protocol = location.protocol === 'https:' ? 'wss' : 'ws';
  const ws = new WebSocket(`${protocol}://${location.host}/__nexus/ws`);

  ws.onopen = () => {
    connected = true;
  };

  ws.onmessage = async (event) => {
    const msg = JSON.parse(event.data);
    switch (msg.type) {
      case 'connected':
        generation = msg.generation;
        console.log(`[nexus] connected at generation ${generation}.`);
        break;
      case 'full-reload':
        location.reload();
        return;
      case 'update':
        await applyUpdate(msg.changedIds, msg.generation);
        generation = msg.generation;
        break;
      case 'error':
        showError(msg.error);
        break;
    }
    ws.send(JSON.stringify({ type: 'ack', generation }));
  };

  ws.onclose = () => {
    if (connected) {
      console.log('[nexus] server connection lost. Reloading...');
      connected = false;
      setTimeout(() => location.reload(), 1000);
    }
  };

  setInterval(() => {
    if (ws.readyState === WebSocket.OPEN) {
      ws.send(JSON.stringify({ type: 'ping' }));
    }
  }, 30000);
}

async function applyUpdate(ids, nextGeneration) {
  clearError();
  const accepted = ids.filter((id) => hotModules.get(id)?.selfAccepting);
  if (accepted.length === 0) {
    location.reload();
    return;
  }
  for (const id of accepted) {
    const dispose = disposers.get(id);
    if (dispose) {
      dispose(dataMap.get(id));
    }
    const query = isScript(id) ? '?' : '?import&';
    try {
      const mod = await import(`${id}${query}t=${nextGeneration}`);
      for (const cb of hotModules.get(id).callbacks) {
        cb(mod);
      }
      console.log(`[nexus] hot updated: ${id}`);
    } catch (err) {
      console.error(`[nexus] failed to update ${id}`, err);
      location.reload();
      return;
    }
  }
}

let overlay = null;

function showError(error) {
  console.error(`[nexus] ${error.code}: ${error.message}`);
  clearError();
  overlay = document.createElement('pre');
  overlay.setAttribute('data-nexus-overlay', '');
  overlay.style.cssText =
    'position:fixed;inset:0;margin:0;padding:24px;z-index:99999;background:rgba(0,0,0,.85);color:#ff5555;white-space:pre-wrap;font:14px monospace';
  overlay.textContent = `${error.code}\n\n${error.message}${error.module ? `\n\n${error.module}` : ''}`;
  overlay.onclick = clearError;
  document.body.appendChild(overlay);
}

function clearError() {
  if (overlay) {
    overlay.remove();
    overlay = null;
  }
}

export function createHotContext(id) {
  if (!dataMap.has(id)) {
    dataMap.set(id, {});
  }
  const entry = { selfAccepting: false, callbacks: [] };
  hotModules.set(id, entry);
  return {
    get data() {
      return dataMap.get(id);
    },
    accept(cb) {
      entry.selfAccepting = true;
      if (typeof cb === 'function') {
        entry.callbacks.push(cb);
      }
    },
    dispose(cb) {
      disposers.set(id, cb);
    },
    invalidate() {
      location.reload();
    },
  };
}

connect();
"#;
