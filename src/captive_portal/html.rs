//! 内嵌 HTML 静态资源

pub const INDEX_HTML: &str = r#"<!DOCTYPE html>
<html lang="de-CH">
<head>
    <meta charset="UTF-8">
    <meta name="viewport" content="width=device-width, initial-scale=1.0">
    <title>Tegschtuhr</title>
    <style>
        * { box-sizing: border-box; margin: 0; padding: 0; }
        body {
            font-family: -apple-system, BlinkMacSystemFont, "Segoe UI", Roboto, sans-serif;
            background: #1a1a2e;
            color: #eee;
            min-height: 100vh;
            padding: 20px;
        }
        .container { max-width: 420px; margin: 0 auto; }
        h1 { text-align: center; margin-bottom: 24px; font-size: 24px; color: #00d4ff; }
        h2 { font-size: 18px; margin: 24px 0 12px; color: #00d4ff; }
        .form-group { margin-bottom: 14px; }
        label { display: block; margin-bottom: 6px; font-size: 14px; color: #aaa; }
        input, select {
            width: 100%;
            padding: 10px;
            border: 1px solid #333;
            border-radius: 8px;
            background: #16213e;
            color: #fff;
            font-size: 16px;
        }
        input[type=checkbox] { width: auto; }
        input:focus, select:focus { outline: none; border-color: #00d4ff; }
        button {
            width: 100%;
            padding: 14px;
            border: none;
            border-radius: 8px;
            font-size: 16px;
            cursor: pointer;
            background: #00d4ff;
            color: #1a1a2e;
            font-weight: bold;
            margin-top: 8px;
        }
        .secondary { background: #0f3460; color: #00d4ff; }
        #device-info {
            background: #16213e;
            padding: 12px;
            border-radius: 8px;
            font-size: 14px;
            line-height: 1.6;
        }
        #device-info span { color: #00d4ff; }
        #matrix { display: grid; grid-template-columns: repeat(14, 1fr); gap: 2px; }
        #matrix input { margin: 0 auto; }
    </style>
</head>
<body>
    <div class="container">
        <h1>Tegschtuhr</h1>

        <div id="device-info">
            Temperatur: <span id="temperature">-</span> &deg;C<br>
            Feuchtigkeit: <span id="humidity">-</span> %<br>
            Luftdruck: <span id="pressure">-</span> hPa<br>
            Helligkeit: <span id="brightness">-</span><br>
            MAC: <span id="mac_address">-</span><br>
            Firmware: <span id="current_version">-</span>
            <span id="update-note"></span>
        </div>

        <h2>WLAN</h2>
        <form action="/login" method="get">
            <div class="form-group">
                <label>Netzwerk</label>
                <input type="text" name="ssid" id="ssid" list="networks" required>
                <datalist id="networks"></datalist>
            </div>
            <div class="form-group">
                <label>Passwort</label>
                <input type="password" name="password">
            </div>
            <button type="submit">Verbinden</button>
        </form>

        <h2>Einstellungen</h2>
        <form action="/settings" method="get" id="settings">
            <div class="form-group"><label>Breitengrad</label><input name="lat" id="lat"></div>
            <div class="form-group"><label>L&auml;ngengrad</label><input name="lon" id="lon"></div>
            <div class="form-group"><label>Prognose-Index</label><input name="foreindex" id="foreindex" type="number" min="0" max="255"></div>
            <div class="form-group"><label>Wetter API-Key</label><input name="ap_id" id="ap_id"></div>
            <div class="form-group"><label>Minimale Stufe</label><input name="min_level" id="min_level" type="number" min="0" max="255"></div>
            <div class="form-group"><label>Minimale Helligkeit (Lux)</label><input name="min_lum" id="min_lum" type="number" min="0"></div>
            <div class="form-group"><label>Maximale Stufe</label><input name="max_level" id="max_level" type="number" min="0" max="255"></div>
            <div class="form-group"><label>Maximale Helligkeit (Lux)</label><input name="max_lum" id="max_lum" type="number" min="0"></div>
            <div class="form-group"><label>Eigene Pixel</label><div id="matrix"></div></div>
            <div class="form-group"><label>Konfigurations-Timeout (s)</label><input name="timeout" id="timeout" type="number" min="1"></div>
            <div class="form-group"><label><input type="checkbox" name="debug" id="debug"> Debug</label></div>
            <button type="submit">Speichern</button>
        </form>

        <h2>Vorschau</h2>
        <div class="form-group">
            <label>Helligkeit</label>
            <input type="range" min="0" max="255" value="128" id="level">
        </div>
        <button class="secondary" id="update">Firmware aktualisieren</button>
    </div>

    <script>
        const pad = (n) => String(n).padStart(2, '0');

        function buildMatrix(selected) {
            const matrix = document.getElementById('matrix');
            const on = new Set(selected.map(([r, c]) => r + ',' + c));
            for (let r = 0; r < 12; r++) {
                for (let c = 0; c < 14; c++) {
                    const box = document.createElement('input');
                    box.type = 'checkbox';
                    box.name = 'p' + pad(r) + '_' + pad(c);
                    box.checked = on.has(r + ',' + c);
                    matrix.appendChild(box);
                }
            }
        }

        async function loadInfo() {
            try {
                const resp = await fetch('/get_info');
                const info = await resp.json();
                for (const key of ['temperature', 'humidity', 'pressure', 'brightness', 'mac_address', 'current_version']) {
                    if (info[key] !== null && info[key] !== undefined) {
                        document.getElementById(key).textContent = info[key];
                    }
                }
                if (info.update_available) {
                    document.getElementById('update-note').textContent = '(neu: ' + info.latest_version + ')';
                }
                if (info.ssid) document.getElementById('ssid').value = info.ssid;
                const list = document.getElementById('networks');
                for (const net of info.networks || []) {
                    const opt = document.createElement('option');
                    opt.value = net.ssid;
                    list.appendChild(opt);
                }
                for (const key of ['lat', 'lon', 'foreindex', 'ap_id', 'min_level', 'min_lum', 'max_level', 'max_lum', 'timeout']) {
                    document.getElementById(key).value = info[key];
                }
                document.getElementById('debug').checked = !!info.debug;
                buildMatrix(info.custom_pos || []);
            } catch (e) {
                console.error('Failed to load info:', e);
                buildMatrix([]);
            }
        }

        document.getElementById('level').addEventListener('change', (e) => {
            fetch('/lightprev?level=' + e.target.value);
        });
        document.getElementById('update').addEventListener('click', () => {
            fetch('/update_software');
        });

        loadInfo();
    </script>
</body>
</html>"#;
